//! プロセス制御機能
//!
//! 停止はすべてのスレッドに対して行います（all-stop）。
//! どれか1つのスレッドが停止を報告すると、残りのスレッドにも SIGSTOP を送って止めます。

use crate::{Registers, Result, TargetError, Thread, ThreadId};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{BTreeMap, VecDeque};
use std::ffi::CString;
use std::marker::PhantomData;
use std::path::Path;

/// 停止イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 実行継続中のSIGTRAP（ブレークポイントヒット）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信（次の再開時に再送される）。SIGURG などは報告せずに届ける
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる強制終了
    Killed(Signal),
}

/// 停止イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    /// 停止を報告したスレッド
    pub tid: ThreadId,
    pub reason: StopReason,
}

impl StopEvent {
    pub fn is_exit(&self) -> bool {
        matches!(self.reason, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// 再開の方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Continue,
    Step,
}

/// トレース対象の子だけを待つ
///
/// `__WNOTHREAD` がないと同じプロセスの別スレッドがトレースしている子のイベントまで拾ってしまう。
fn wait_flags() -> Option<WaitPidFlag> {
    Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD)
}

/// デバッグ対象のプロセス
///
/// ptrace の要求はトレースを開始したスレッドからしか発行できないため、
/// このハンドルはスレッド間で移動できません（`!Send`）。
pub struct Process {
    pid: Pid,
    threads: BTreeMap<ThreadId, Thread>,
    /// 他のスレッドを止めている間に届いた停止。次の再開より先に報告する
    pending_events: VecDeque<StopEvent>,
    exit_status: Option<i32>,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl Process {
    fn new(pid: Pid, threads: BTreeMap<ThreadId, Thread>) -> Self {
        Self {
            pid,
            threads,
            pending_events: VecDeque::new(),
            exit_status: None,
            detached: false,
            _not_send: PhantomData,
        }
    }

    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスはexecve直後の停止状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execve, fork, ForkResult};

        let program = program.as_ref();
        let launch_error = |reason: String| TargetError::Launch {
            path: program.display().to_string(),
            reason,
        };

        if !program.is_file() {
            return Err(launch_error("no such file".to_string()).into());
        }

        let program_path = program
            .to_str()
            .ok_or_else(|| launch_error("path is not valid UTF-8".to_string()))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork() }.map_err(|e| launch_error(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child } => {
                match waitpid(child, wait_flags())? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    WaitStatus::Exited(_, code) => {
                        return Err(launch_error(format!("exited with status {} before exec", code)).into());
                    }
                    status => {
                        return Err(launch_error(format!("unexpected wait status {:?}", status)).into());
                    }
                }

                ptrace::setoptions(child, Options::PTRACE_O_TRACECLONE)?;
                tracing::info!(pid = child.as_raw(), program = %program.display(), "process spawned");

                let threads = BTreeMap::from([(child.as_raw(), Thread::new(child.as_raw()))]);
                Ok(Self::new(child, threads))
            }
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execve(&program_cstring, &cstring_args, &env);
                }
                // execve が戻るのは失敗したときだけ
                unsafe { nix::libc::_exit(127) }
            }
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// `/proc/<pid>/task` に見えるすべてのスレッドをトレースし、停止を待ちます。
    pub fn attach(pid: i32) -> Result<Self> {
        let attach_error = |reason: String| TargetError::Attach { pid, reason };

        let mut tids = task_ids(pid).map_err(|e| attach_error(e.to_string()))?;
        // スレッドグループリーダーを最初に
        tids.retain(|&tid| tid != pid);
        tids.insert(0, pid);

        let mut threads = BTreeMap::new();
        for tid in tids {
            let thread_pid = Pid::from_raw(tid);
            if let Err(e) = ptrace::attach(thread_pid) {
                if tid == pid {
                    return Err(attach_error(e.to_string()).into());
                }
                // 列挙後に終了したスレッド
                tracing::debug!(tid, error = %e, "skipping thread");
                continue;
            }

            let mut thread = Thread::new(tid);
            thread.pending_signal = wait_attach_stop(thread_pid).map_err(|e| attach_error(e.to_string()))?;
            ptrace::setoptions(thread_pid, Options::PTRACE_O_TRACECLONE)?;
            threads.insert(tid, thread);
        }

        tracing::info!(pid, threads = threads.len(), "attached to process");
        Ok(Self::new(Pid::from_raw(pid), threads))
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// トレース中のスレッド
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// スレッドを取得する
    pub fn thread(&self, tid: ThreadId) -> Result<&Thread> {
        self.threads
            .get(&tid)
            .ok_or_else(|| TargetError::UnknownThread(tid).into())
    }

    /// 終了ステータス（終了していれば）
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// 終了済みなら `ProcessExited` を返す
    pub fn ensure_alive(&self) -> Result<()> {
        match self.exit_status {
            Some(code) => Err(TargetError::ProcessExited(code).into()),
            None => Ok(()),
        }
    }

    /// 停止中のすべてのスレッドを再開し、次の停止まで待機する
    ///
    /// 保留中の停止があれば、何も再開せずにそれを返します。
    /// 戻ったときにはすべてのスレッドが停止しています。
    pub fn continue_and_wait(&mut self) -> Result<StopEvent> {
        self.ensure_alive()?;

        while let Some(event) = self.pending_events.pop_front() {
            if self.threads.contains_key(&event.tid) {
                tracing::debug!(?event, "reporting deferred stop");
                return Ok(event);
            }
        }

        self.resume_stopped()?;
        let event = self.wait_for_stop(None, Resume::Continue)?;
        self.settle(event)
    }

    /// 1命令だけ実行して停止する（ステップ実行）
    ///
    /// 他のスレッドは止めたままです。関数呼び出しの中にも入ります（ステップイン）。
    pub fn step(&mut self, tid: ThreadId) -> Result<StopEvent> {
        self.ensure_alive()?;
        self.resume(tid, Resume::Step)?;
        let event = self.wait_for_stop(Some(tid), Resume::Step)?;
        self.settle(event)
    }

    /// 保留中のトラップのうち `is_breakpoint(pc - 1)` を満たすものを取り消し、PCを巻き戻す
    ///
    /// ブレークポイントを外す前に呼ぶと、そのスレッドは再開後に元の命令から実行します。
    pub fn rewind_pending_traps(&mut self, is_breakpoint: impl Fn(u64) -> bool) -> Result<()> {
        let mut kept = VecDeque::with_capacity(self.pending_events.len());
        while let Some(event) = self.pending_events.pop_front() {
            if event.reason == StopReason::Breakpoint && self.threads.contains_key(&event.tid) {
                let registers = Registers::new(event.tid);
                let address = registers.get_pc()?.wrapping_sub(1);
                if is_breakpoint(address) {
                    registers.set_pc(address)?;
                    tracing::debug!(tid = event.tid, address = format!("0x{:x}", address), "deferred trap rewound");
                    continue;
                }
            }
            kept.push_back(event);
        }
        self.pending_events = kept;
        Ok(())
    }

    /// すべてのスレッドからデタッチする
    ///
    /// ブレークポイントの復元は呼び出し側の責任です。
    pub fn detach(&mut self) -> Result<()> {
        if self.detached || self.exit_status.is_some() {
            return Ok(());
        }

        if self.stop_all()?.is_some() {
            // 止めている間に終了した
            return Ok(());
        }
        self.pending_events.clear();

        let tids: Vec<ThreadId> = self.threads.keys().copied().collect();
        for tid in tids {
            let signal = match self.drain_requested_stop(tid) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(tid, error = %e, "could not collect stop before detach");
                    continue;
                }
            };
            if let Err(e) = ptrace::detach(Pid::from_raw(tid), signal) {
                tracing::warn!(tid, error = %e, "detach failed");
            }
        }

        self.detached = true;
        tracing::info!(pid = self.pid(), "detached from process");
        Ok(())
    }

    fn resume(&mut self, tid: ThreadId, mode: Resume) -> Result<()> {
        let thread = self
            .threads
            .get_mut(&tid)
            .ok_or(TargetError::UnknownThread(tid))?;
        let signal = thread.pending_signal.take();
        let pid = Pid::from_raw(tid);

        let result = match mode {
            Resume::Continue => ptrace::cont(pid, signal),
            Resume::Step => ptrace::step(pid, signal),
        };
        match result {
            Ok(()) => {}
            // 終了して回収待ちのスレッド。終了は waitpid で届く
            Err(Errno::ESRCH) => tracing::debug!(tid, "thread vanished before resume"),
            Err(e) => return Err(e.into()),
        }
        thread.stopped = false;
        Ok(())
    }

    /// 停止中のスレッドをすべて再開する
    fn resume_stopped(&mut self) -> Result<()> {
        let stopped: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.stopped)
            .map(Thread::tid)
            .collect();
        for tid in stopped {
            self.resume(tid, Resume::Continue)?;
        }
        Ok(())
    }

    /// 報告する停止が決まったら残りのスレッドを止める
    fn settle(&mut self, event: StopEvent) -> Result<StopEvent> {
        if event.is_exit() {
            return Ok(event);
        }
        Ok(self.stop_all()?.unwrap_or(event))
    }

    /// 次の停止イベントまで待機する
    ///
    /// clone イベント、新しいスレッドの初回停止、こちらが送ったSIGSTOPは吸収してスレッドを再開します。
    /// `target` を指定した場合はそのスレッドのイベントだけを待ちます。
    fn wait_for_stop(&mut self, mut target: Option<ThreadId>, mode: Resume) -> Result<StopEvent> {
        loop {
            let wait_pid = Pid::from_raw(target.unwrap_or(-1));
            let status = waitpid(wait_pid, wait_flags())?;
            tracing::trace!(?status, "wait status");

            let resume_mode = |tid: ThreadId| if target == Some(tid) { mode } else { Resume::Continue };

            match status {
                WaitStatus::PtraceEvent(pid, _, event) => {
                    let tid = pid.as_raw();
                    if event == Event::PTRACE_EVENT_CLONE as i32 {
                        self.record_clone(pid)?;
                    }
                    self.mark_stopped(tid);
                    self.resume(tid, resume_mode(tid))?;
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.swallows_stop(pid.as_raw()) => {
                    let tid = pid.as_raw();
                    self.consume_stop(tid);
                    self.resume(tid, resume_mode(tid))?;
                }
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    let tid = pid.as_raw();
                    self.mark_stopped(tid);
                    let reason = match mode {
                        Resume::Step if target == Some(tid) => StopReason::Step,
                        _ => StopReason::Breakpoint,
                    };
                    return Ok(StopEvent { tid, reason });
                }
                WaitStatus::Stopped(pid, signal) if passes_through(signal) => {
                    let tid = pid.as_raw();
                    self.record_signal(tid, signal);
                    self.resume(tid, resume_mode(tid))?;
                }
                WaitStatus::Stopped(pid, signal) => {
                    let tid = pid.as_raw();
                    self.record_signal(tid, signal);
                    tracing::debug!(tid, ?signal, "stopped by signal");
                    return Ok(StopEvent {
                        tid,
                        reason: StopReason::Signal(signal),
                    });
                }
                WaitStatus::Exited(pid, code) => {
                    if let Some(event) = self.thread_gone(pid, StopReason::Exited(code), code) {
                        return Ok(event);
                    }
                    if target == Some(pid.as_raw()) {
                        // ステップ中のスレッドが消えたら、残りを再開して次の停止を待つ
                        target = None;
                        self.resume_stopped()?;
                    }
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    let code = 128 + signal as i32;
                    if let Some(event) = self.thread_gone(pid, StopReason::Killed(signal), code) {
                        return Ok(event);
                    }
                    if target == Some(pid.as_raw()) {
                        target = None;
                        self.resume_stopped()?;
                    }
                }
                _ => {}
            }
        }
    }

    /// 実行中のスレッドをすべて止める
    ///
    /// 止めている間に別のスレッドが報告したトラップやシグナルは `pending_events` に積みます。
    /// プロセス全体が終了した場合はその終了イベントを返します。
    fn stop_all(&mut self) -> Result<Option<StopEvent>> {
        loop {
            let running: Vec<ThreadId> = self
                .threads
                .values()
                .filter(|t| !t.stopped)
                .map(Thread::tid)
                .collect();
            if running.is_empty() {
                return Ok(None);
            }

            // 待っている間に clone されたスレッドは次の周回で止める
            for tid in running {
                if let Some(exit) = self.stop_thread(tid)? {
                    return Ok(Some(exit));
                }
            }
        }
    }

    /// 1つのスレッドに SIGSTOP を送り、停止を待つ
    fn stop_thread(&mut self, tid: ThreadId) -> Result<Option<StopEvent>> {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return Ok(None);
        };
        if !thread.awaiting_start && !thread.stop_requested {
            match tgkill(self.pid, tid, Signal::SIGSTOP) {
                Ok(()) => thread.stop_requested = true,
                // 終了処理中。終了は waitpid で届く
                Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }

        loop {
            match waitpid(Pid::from_raw(tid), wait_flags())? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.swallows_stop(tid) => {
                    self.consume_stop(tid);
                    return Ok(None);
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    if event == Event::PTRACE_EVENT_CLONE as i32 {
                        self.record_clone(pid)?;
                    }
                    self.mark_stopped(tid);
                    return Ok(None);
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    self.mark_stopped(tid);
                    self.pending_events.push_back(StopEvent {
                        tid,
                        reason: StopReason::Breakpoint,
                    });
                    return Ok(None);
                }
                WaitStatus::Stopped(_, signal) if passes_through(signal) => {
                    self.record_signal(tid, signal);
                    return Ok(None);
                }
                WaitStatus::Stopped(_, signal) => {
                    self.record_signal(tid, signal);
                    self.pending_events.push_back(StopEvent {
                        tid,
                        reason: StopReason::Signal(signal),
                    });
                    return Ok(None);
                }
                WaitStatus::Exited(pid, code) => {
                    return Ok(self.thread_gone(pid, StopReason::Exited(code), code));
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    let code = 128 + signal as i32;
                    return Ok(self.thread_gone(pid, StopReason::Killed(signal), code));
                }
                _ => {}
            }
        }
    }

    /// 送ったSIGSTOPがまだ届いていないスレッドを一度だけ動かして受け取る
    ///
    /// 受け取らずにデタッチすると、トレース外でSIGSTOPが届いてプロセスが止まってしまう。
    /// 途中で届いた他のシグナルはデタッチ時に渡すために返します。
    fn drain_requested_stop(&mut self, tid: ThreadId) -> Result<Option<Signal>> {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return Ok(None);
        };
        let mut deliver = thread.pending_signal.take();
        if !thread.stop_requested {
            return Ok(deliver);
        }
        thread.stop_requested = false;

        let pid = Pid::from_raw(tid);
        loop {
            ptrace::cont(pid, None)?;
            match waitpid(pid, wait_flags())? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => return Ok(deliver),
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                WaitStatus::Stopped(_, signal) => deliver = Some(signal),
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.threads.remove(&tid);
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn record_clone(&mut self, parent: Pid) -> Result<()> {
        let new_tid = ptrace::getevent(parent)? as ThreadId;
        self.threads
            .entry(new_tid)
            .or_insert_with(|| Thread::cloned(new_tid));
        tracing::debug!(parent = parent.as_raw(), tid = new_tid, "thread created");
        Ok(())
    }

    fn record_signal(&mut self, tid: ThreadId, signal: Signal) {
        let thread = self.threads.entry(tid).or_insert_with(|| Thread::new(tid));
        thread.stopped = true;
        thread.pending_signal = Some(signal);
    }

    /// スレッド終了を記録する。プロセス全体が終了したらイベントを返す
    fn thread_gone(&mut self, pid: Pid, reason: StopReason, code: i32) -> Option<StopEvent> {
        let tid = pid.as_raw();
        self.threads.remove(&tid);

        if pid == self.pid {
            self.exit_status = Some(code);
            self.threads.clear();
            self.pending_events.clear();
            tracing::info!(pid = tid, ?reason, "process exited");
            return Some(StopEvent { tid, reason });
        }

        tracing::debug!(tid, "thread exited");
        None
    }

    /// このSIGSTOPは吸収すべきものか（新しいスレッドの初回停止か、こちらが送ったもの）
    fn swallows_stop(&self, tid: ThreadId) -> bool {
        self.threads
            .get(&tid)
            .map_or(true, |t| t.awaiting_start || t.stop_requested)
    }

    fn consume_stop(&mut self, tid: ThreadId) {
        let thread = self
            .threads
            .entry(tid)
            .or_insert_with(|| Thread::cloned(tid));
        if thread.awaiting_start {
            thread.awaiting_start = false;
        } else {
            thread.stop_requested = false;
        }
        thread.stopped = true;
    }

    fn mark_stopped(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.stopped = true;
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

/// `/proc/<pid>/task` のスレッドID一覧
fn task_ids(pid: i32) -> std::io::Result<Vec<ThreadId>> {
    let mut tids: Vec<ThreadId> = std::fs::read_dir(format!("/proc/{}/task", pid))?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// アタッチ直後の停止を待つ。SIGSTOP以外で止まった場合はそのシグナルを返す
fn wait_attach_stop(tid: Pid) -> Result<Option<Signal>> {
    match waitpid(tid, wait_flags())? {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => Ok(None),
        WaitStatus::Stopped(_, signal) => Ok(Some(signal)),
        WaitStatus::Exited(_, code) => Err(TargetError::ProcessExited(code).into()),
        status => Err(anyhow::anyhow!("Unexpected wait status after attach: {:?}", status)),
    }
}

/// 停止として報告せず、そのまま届けるシグナル
///
/// Goランタイムはプリエンプションに SIGURG を使うので、これで止まると継続できない。
fn passes_through(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGURG
            | Signal::SIGCHLD
            | Signal::SIGWINCH
            | Signal::SIGPROF
            | Signal::SIGALRM
            | Signal::SIGVTALRM
    )
}

/// スレッドを指定してシグナルを送る
fn tgkill(pid: Pid, tid: ThreadId, signal: Signal) -> nix::Result<()> {
    let ret = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_tgkill,
            pid.as_raw(),
            tid,
            signal as i32,
        )
    };
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_signals_pass_through() {
        assert!(passes_through(Signal::SIGURG));
        assert!(passes_through(Signal::SIGCHLD));
        assert!(!passes_through(Signal::SIGSEGV));
        assert!(!passes_through(Signal::SIGINT));
        assert!(!passes_through(Signal::SIGTRAP));
    }

    #[test]
    fn test_exit_events() {
        let exited = StopEvent {
            tid: 1,
            reason: StopReason::Exited(3),
        };
        let killed = StopEvent {
            tid: 1,
            reason: StopReason::Killed(Signal::SIGKILL),
        };
        let trapped = StopEvent {
            tid: 1,
            reason: StopReason::Breakpoint,
        };
        assert!(exited.is_exit());
        assert!(killed.is_exit());
        assert!(!trapped.is_exit());
    }
}
