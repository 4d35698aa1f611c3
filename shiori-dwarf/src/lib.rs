//! Shiori DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! デバッグ情報エントリのカーソル、ソース行とPCの相互変換、
//! 変数の名前解決と値の描画を行います。

pub mod cursor;
pub mod decode;
pub mod entry;
pub mod error;
pub mod expr;
pub mod frame;
pub mod lines;
pub mod loader;
pub mod loc_eval;
pub mod memory;
pub mod symbols;
pub mod types;
pub mod variables;

pub use cursor::{EntryCursor, ScanMode};
pub use decode::{DecodeConfig, DisplayValue, ValueDecoder};
pub use entry::{default_encoding, AttrValue, DebugEntry, DebugInfo, DebugInfoBuilder, Offset};
pub use error::DwarfError;
pub use expr::{Expression, ExpressionParser, SliceRange};
pub use frame::{regs, CallFrameInfo, FrameContext};
pub use lines::{LineAddress, LineInfo, LineInfoProvider, LineRow};
pub use loader::{DwarfLoader, DwarfReader};
pub use loc_eval::{Loc, LocationEvaluator};
pub use memory::MemoryReader;
pub use symbols::{Symbol, SymbolResolver};
pub use types::{Member, TypeKind, TypeResolver};
pub use variables::{Variable, VariableEvaluator};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
