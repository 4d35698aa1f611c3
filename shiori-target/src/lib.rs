//! Shiori ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント設定などを行います。

pub mod breakpoint;
pub mod error;
pub mod memory;
pub mod process;
pub mod registers;
pub mod thread;

pub use breakpoint::{SoftwareBreakpoint, INT3_OPCODE};
pub use error::TargetError;
pub use memory::{Memory, MemoryMapping, MemoryWriter};
pub use process::{Process, StopEvent, StopReason};
pub use registers::Registers;
pub use thread::{Thread, ThreadId};

// シグナル種別は停止理由の一部として公開する
pub use nix::sys::signal::Signal;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
