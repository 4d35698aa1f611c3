//! ターゲット制御のエラー

use thiserror::Error;

/// プロセス制御で発生するエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("could not attach to process {pid}: {reason}")]
    Attach { pid: i32, reason: String },

    #[error("could not launch {path}: {reason}")]
    Launch { path: String, reason: String },

    /// 終了後は以降のすべての操作がこのエラーになる
    #[error("process exited with status {0}")]
    ProcessExited(i32),

    #[error("could not access {len} bytes of memory at 0x{addr:x}")]
    MemoryAccess { addr: u64, len: usize },

    #[error("could not insert breakpoint at 0x{0:x}")]
    BadAddress(u64),

    #[error("thread {0} is not traced")]
    UnknownThread(i32),
}
