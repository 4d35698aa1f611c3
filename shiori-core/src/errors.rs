//! セッション層のエラー

use crate::BreakpointId;
use thiserror::Error;

/// デバッガ操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebuggerError {
    #[error("not attached to a process")]
    NotAttached,

    #[error("DWARF information not loaded")]
    DwarfNotLoaded,

    #[error("breakpoint already set at 0x{0:x}")]
    AlreadySet(u64),

    #[error("no breakpoint at 0x{0:x}")]
    NotFound(u64),

    #[error("no breakpoint with id {0}")]
    UnknownBreakpoint(BreakpointId),

    #[error("no code at {file}:{line}")]
    NoCodeAtLine { file: String, line: u64 },

    #[error("function {0} not found")]
    FunctionNotFound(String),
}
