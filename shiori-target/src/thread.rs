//! スレッド管理機能

use crate::Registers;
use nix::sys::signal::Signal;

/// スレッドID
pub type ThreadId = i32;

/// トレース中のスレッド
#[derive(Debug, Clone)]
pub struct Thread {
    tid: ThreadId,
    /// ptrace停止中かどうか
    pub(crate) stopped: bool,
    /// 生成直後のSIGSTOPをまだ受け取っていない
    pub(crate) awaiting_start: bool,
    /// こちらから送ったSIGSTOPをまだ受け取っていない
    pub(crate) stop_requested: bool,
    /// 次の再開時に届けるシグナル
    pub(crate) pending_signal: Option<Signal>,
}

impl Thread {
    /// 停止状態のスレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            stopped: true,
            awaiting_start: false,
            stop_requested: false,
            pending_signal: None,
        }
    }

    /// clone で生成され、初回停止待ちのスレッド
    pub(crate) fn cloned(tid: ThreadId) -> Self {
        Self {
            stopped: false,
            awaiting_start: true,
            ..Self::new(tid)
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// 次の再開時に再送するシグナル
    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending_signal
    }

    /// レジスタアクセスを取得する
    pub fn registers(&self) -> Registers {
        Registers::new(self.tid)
    }
}
