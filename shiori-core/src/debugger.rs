//! デバッガのメインロジック

use crate::breakpoint::BreakpointManager;
use crate::parse::Location;
use crate::{Breakpoint, BreakpointId, DebuggerError, Result, ThreadContext};
use shiori_dwarf::{
    CallFrameInfo, DebugInfo, DecodeConfig, DwarfLoader, FrameContext, LineAddress, LineInfo,
    LineInfoProvider, Symbol, SymbolResolver, Variable,
};
use shiori_target::{
    Memory, Process, Registers, Signal, StopEvent, StopReason, TargetError, ThreadId,
};
use std::path::Path;

/// 読み込んだ実行ファイルのデバッグ情報
struct Binary {
    loader: DwarfLoader,
    info: DebugInfo,
    lines: LineInfoProvider,
    symbols: SymbolResolver,
    cfi: CallFrameInfo,
}

/// デバッグ対象のプロセスとセッション状態
struct Target {
    process: Process,
    memory: Memory,
    /// 最後に停止したスレッド
    current_tid: ThreadId,
    /// PIEのロードバイアス（非PIEなら0）
    load_bias: u64,
}

/// デバッガ
///
/// 操作はすべて同期的で、`continue_execution` と `step` は次の停止まで戻りません。
/// 停止はすべてのスレッドに及ぶので、セッションから見える対象プロセスは常に停止中か終了済みです。
pub struct Debugger {
    binary: Option<Binary>,
    target: Option<Target>,
    breakpoint_manager: BreakpointManager,
    last_stop: Option<StopEvent>,
    config: DecodeConfig,
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new() -> Self {
        Self::with_config(DecodeConfig::default())
    }

    /// 値の描画設定を指定して作成する
    pub fn with_config(config: DecodeConfig) -> Self {
        Self {
            binary: None,
            target: None,
            breakpoint_manager: BreakpointManager::new(),
            last_stop: None,
            config,
        }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// ELFバイナリからDWARF情報を読み込む
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let loader = DwarfLoader::load(path)?;
        let info = loader.debug_info()?;
        let lines = LineInfoProvider::new(&loader, &info)?;
        let symbols = SymbolResolver::new(&loader)?;
        let cfi = loader.call_frame_info();

        tracing::info!(entries = info.len(), "debug info loaded");
        self.binary = Some(Binary {
            loader,
            info,
            lines,
            symbols,
            cfi,
        });
        Ok(())
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスはexecve直後に停止状態で開始されます。
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        let process = Process::spawn(program, args)?;
        self.start_session(process)
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let process = Process::attach(pid)?;
        self.start_session(process)
    }

    fn start_session(&mut self, process: Process) -> Result<()> {
        if self.target.is_some() {
            self.detach()?;
        }

        let pid = process.pid();
        let memory = Memory::new(pid);
        let is_pie = self.binary.as_ref().is_some_and(|b| b.loader.is_pie());
        let load_bias = if is_pie { memory.load_bias()? } else { 0 };
        tracing::debug!(pid, load_bias = format!("0x{:x}", load_bias), "session started");

        self.breakpoint_manager = BreakpointManager::new();
        self.last_stop = None;
        self.target = Some(Target {
            process,
            memory,
            current_tid: pid,
            load_bias,
        });
        Ok(())
    }

    /// プロセスからデタッチする
    ///
    /// 設置したブレークポイントをすべて元に戻してから切り離します。
    pub fn detach(&mut self) -> Result<()> {
        let Some(mut target) = self.target.take() else {
            return Ok(());
        };

        if target.process.exit_status().is_some() {
            self.breakpoint_manager.forget_all();
            return Ok(());
        }

        let manager = &self.breakpoint_manager;
        let rewound = target
            .process
            .rewind_pending_traps(|address| manager.get(address).is_some());
        let restored = self.breakpoint_manager.clear_all(&target.memory);
        target.process.detach()?;
        rewound.and(restored)
    }

    /// 停止中のプロセスを取得する。終了済みなら `ProcessExited`
    fn stopped_target(&self) -> Result<&Target> {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        target.process.ensure_alive()?;
        Ok(target)
    }

    fn binary(&self) -> Result<&Binary> {
        self.binary
            .as_ref()
            .ok_or_else(|| DebuggerError::DwarfNotLoaded.into())
    }

    fn load_bias(&self) -> u64 {
        self.target.as_ref().map_or(0, |t| t.load_bias)
    }

    /// シンボル名からアドレスを解決する（実行時アドレス）
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        let addr = self.binary.as_ref()?.symbols.resolve(name)?;
        Some(addr + self.load_bias())
    }

    /// アドレスからシンボルを解決する
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let addr = addr.checked_sub(self.load_bias())?;
        self.binary.as_ref()?.symbols.reverse_resolve(addr)
    }

    /// ブレークポイントを設定する
    pub fn break_at(&mut self, address: u64) -> Result<&Breakpoint> {
        self.set_breakpoint(address, None)
    }

    /// ソース行にブレークポイントを設定する
    pub fn break_at_line(&mut self, file: &str, line: u64) -> Result<&Breakpoint> {
        let resolved = self
            .line_to_pc(file, line)?
            .ok_or_else(|| DebuggerError::NoCodeAtLine {
                file: file.to_string(),
                line,
            })?;
        self.set_breakpoint(resolved.pc, Some(format!("{}:{}", file, line)))
    }

    /// 関数の先頭にブレークポイントを設定する
    pub fn break_at_symbol(&mut self, name: &str) -> Result<&Breakpoint> {
        self.binary()?;
        let address = self
            .resolve_symbol(name)
            .ok_or_else(|| DebuggerError::FunctionNotFound(name.to_string()))?;
        self.set_breakpoint(address, Some(name.to_string()))
    }

    /// パース済みの位置にブレークポイントを設定する
    pub fn break_at_location(&mut self, location: &Location) -> Result<&Breakpoint> {
        match location {
            Location::Address(address) => self.break_at(*address),
            Location::Line { file, line } => self.break_at_line(file, *line),
            Location::Symbol(name) => self.break_at_symbol(name),
        }
    }

    fn set_breakpoint(&mut self, address: u64, location: Option<String>) -> Result<&Breakpoint> {
        let target = self.target.as_ref().ok_or(DebuggerError::NotAttached)?;
        target.process.ensure_alive()?;
        self.breakpoint_manager
            .add_and_enable(address, location, &target.memory)
    }

    /// ブレークポイントを削除する
    ///
    /// このアドレスで止まったまま報告前のスレッドがあれば、PCを戻してから外します。
    pub fn clear_breakpoint(&mut self, address: u64) -> Result<Breakpoint> {
        let target = self.target.as_mut().ok_or(DebuggerError::NotAttached)?;
        target.process.ensure_alive()?;
        if self.breakpoint_manager.get(address).is_some() {
            target.process.rewind_pending_traps(|hit| hit == address)?;
        }
        self.breakpoint_manager
            .remove_and_disable(address, &target.memory)
    }

    /// IDでブレークポイントを削除する
    pub fn clear_breakpoint_id(&mut self, id: BreakpointId) -> Result<Breakpoint> {
        let address = self.breakpoint_manager.address_of(id)?;
        self.clear_breakpoint(address)
    }

    /// すべてのブレークポイントをID順に取得する
    pub fn breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoint_manager.all()
    }

    /// すべてのスレッドを実行継続して次の停止を待つ
    ///
    /// ブレークポイント上で停止している場合は、元の命令を戻して1命令実行し、
    /// トラップを再設置してから再開します。
    /// 対象が終了した場合は `ProcessExited` を返し、以後の操作もすべて同じエラーになります。
    pub fn continue_execution(&mut self) -> Result<StopEvent> {
        if let Some(event) = self.step_over_breakpoint()? {
            if event.reason != StopReason::Step {
                let event = self.record_stop(event);
                return self.reported(event);
            }
        }

        let target = self.target.as_mut().ok_or(DebuggerError::NotAttached)?;
        let event = target.process.continue_and_wait()?;
        let event = self.handle_stop(event)?;
        self.reported(event)
    }

    /// 現在のスレッドで1命令だけ実行する
    pub fn step(&mut self) -> Result<StopEvent> {
        if let Some(event) = self.step_over_breakpoint()? {
            let event = self.record_stop(event);
            return self.reported(event);
        }

        let target = self.target.as_mut().ok_or(DebuggerError::NotAttached)?;
        let event = target.process.step(target.current_tid)?;
        let event = self.handle_stop(event)?;
        self.reported(event)
    }

    /// 終了イベントを `ProcessExited` に変える
    fn reported(&self, event: StopEvent) -> Result<StopEvent> {
        if event.is_exit() {
            let code = self.exit_status().unwrap_or_default();
            return Err(TargetError::ProcessExited(code).into());
        }
        Ok(event)
    }

    /// 現在のPCにブレークポイントがあれば、外して1命令進めて戻す
    fn step_over_breakpoint(&mut self) -> Result<Option<StopEvent>> {
        let target = self.target.as_mut().ok_or(DebuggerError::NotAttached)?;
        target.process.ensure_alive()?;

        let tid = target.current_tid;
        let pc = Registers::new(tid).get_pc()?;
        if !self.breakpoint_manager.is_enabled_at(pc) {
            return Ok(None);
        }

        tracing::trace!(pc = format!("0x{:x}", pc), "stepping over breakpoint");
        self.breakpoint_manager.suspend(pc, &target.memory)?;
        let event = target.process.step(tid)?;
        if !event.is_exit() {
            self.breakpoint_manager.reinstall(pc, &target.memory)?;
        }
        Ok(Some(event))
    }

    /// 停止イベントを解釈する
    ///
    /// ブレークポイントのトラップではPCがINT3の直後を指すので、1バイト巻き戻します。
    fn handle_stop(&mut self, mut event: StopEvent) -> Result<StopEvent> {
        if event.reason == StopReason::Breakpoint {
            let registers = Registers::new(event.tid);
            let address = registers.get_pc()?.wrapping_sub(1);
            if self.breakpoint_manager.get(address).is_some() {
                registers.set_pc(address)?;
                self.breakpoint_manager.record_hit(address);
                tracing::info!(tid = event.tid, address = format!("0x{:x}", address), "breakpoint hit");
            } else {
                event.reason = StopReason::Signal(Signal::SIGTRAP);
            }
        }
        Ok(self.record_stop(event))
    }

    fn record_stop(&mut self, event: StopEvent) -> StopEvent {
        if event.is_exit() {
            self.breakpoint_manager.forget_all();
        } else if let Some(target) = self.target.as_mut() {
            target.current_tid = event.tid;
        }
        self.last_stop = Some(event);
        event
    }

    /// 最後の停止イベント
    pub fn stop_event(&self) -> Option<StopEvent> {
        self.last_stop
    }

    /// 現在のスレッドのプログラムカウンタを取得する
    pub fn get_pc(&self) -> Result<u64> {
        let target = self.stopped_target()?;
        Registers::new(target.current_tid).get_pc()
    }

    /// 現在のスレッドの評価コンテキストを取得する
    pub fn current_thread(&self) -> Result<ThreadContext<'_>> {
        let tid = self.stopped_target()?.current_tid;
        self.thread(tid)
    }

    /// 指定スレッドの評価コンテキストを取得する
    pub fn thread(&self, tid: ThreadId) -> Result<ThreadContext<'_>> {
        let target = self.stopped_target()?;
        let binary = self.binary()?;
        let thread = target.process.thread(tid)?;
        if !thread.is_stopped() {
            return Err(anyhow::anyhow!("thread {} is running", tid));
        }

        let frame = frame_context(binary, &thread.registers(), target.load_bias)?;
        Ok(ThreadContext::new(
            tid,
            frame,
            &binary.info,
            &binary.lines,
            &target.memory,
            &self.config,
        ))
    }

    /// 現在の停止位置で式を評価する
    pub fn eval_symbol(&self, name: &str) -> Result<Variable> {
        self.current_thread()?.eval_symbol(name)
    }

    /// 現在の関数のローカル変数
    pub fn local_variables(&self) -> Result<Vec<Variable>> {
        self.current_thread()?.local_variables()
    }

    /// 現在の関数の引数
    pub fn function_arguments(&self) -> Result<Vec<Variable>> {
        self.current_thread()?.function_arguments()
    }

    /// ソース行を実行時アドレスに変換する
    pub fn line_to_pc(&self, file: &str, line: u64) -> Result<Option<LineAddress>> {
        let bias = self.load_bias();
        Ok(self.binary()?.lines.line_to_pc(file, line).map(|resolved| LineAddress {
            pc: resolved.pc + bias,
            ..resolved
        }))
    }

    /// 実行時アドレスをソース行に変換する
    pub fn pc_to_line(&self, pc: u64) -> Result<Option<LineInfo>> {
        let binary = self.binary()?;
        match pc.checked_sub(self.load_bias()) {
            Some(pc) => binary.lines.pc_to_line(pc),
            None => Ok(None),
        }
    }

    /// 停止中のプロセスのメモリを読む
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.stopped_target()?.memory.read_bytes(address, len)
    }

    /// 停止中のプロセスのメモリに書く
    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.stopped_target()?.memory.write_bytes(address, data)
    }

    /// プロセスID
    pub fn pid(&self) -> Option<i32> {
        self.target.as_ref().map(|t| t.process.pid())
    }

    /// 終了ステータス（終了していれば）
    pub fn exit_status(&self) -> Option<i32> {
        self.target.as_ref()?.process.exit_status()
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            tracing::warn!(error = %e, "detach on drop failed");
        }
    }
}

/// レジスタとCFIから評価用のフレーム情報を作る
fn frame_context(binary: &Binary, registers: &Registers, load_bias: u64) -> Result<FrameContext> {
    let registers = registers.dwarf_registers()?;
    let runtime_pc = registers
        .get(&shiori_dwarf::regs::RIP)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Register rip is not available"))?;
    let pc = runtime_pc.wrapping_sub(load_bias);
    let cfa = binary.cfi.cfa(pc, &registers)?;

    Ok(FrameContext {
        pc,
        cfa,
        load_bias,
        registers,
    })
}
