//! Shiori デバッガのコア機能
//!
//! このクレートは、デバッガの中核となるロジックを提供します。
//! ターゲットプロセスの制御、ブレークポイント管理、変数評価を統合します。

pub mod breakpoint;
pub mod command;
pub mod context;
pub mod debugger;
pub mod errors;
pub mod parse;

pub use breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
pub use command::Command;
pub use context::ThreadContext;
pub use debugger::Debugger;
pub use errors::DebuggerError;
pub use parse::{BreakpointRef, Location};

// 他のクレートから使用するために再エクスポート
pub use shiori_dwarf::{DecodeConfig, DwarfError, LineInfo, Symbol, Variable};
pub use shiori_target::{Signal, StopEvent, StopReason, TargetError, ThreadId};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
