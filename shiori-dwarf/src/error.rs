//! DWARF解析・変数評価のエラー
//!
//! 変数評価のエラーメッセージはユーザーにそのまま表示されるため、
//! 文言を変更してはいけません。

use crate::Offset;
use thiserror::Error;

/// DWARF解析・変数評価で発生するエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DwarfError {
    /// シンボルがスコープ内にもパッケージ変数にも存在しない
    #[error("could not find symbol value for {0}")]
    SymbolNotFound(String),

    /// nilポインタを経由してメンバにアクセスしようとした
    #[error("{0} is nil")]
    NilDereference(String),

    /// 構造体に指定されたメンバが存在しない
    #[error("{base} has no member {member}")]
    NoSuchMember { base: String, member: String },

    /// 構造体でも構造体へのポインタでもない値へのメンバアクセス
    #[error("{0} is not a struct")]
    NotAStruct(String),

    /// 文字列以外へのスライス式
    #[error("{0} is not a string")]
    NotAString(String),

    /// スライス式の範囲外アクセス
    #[error("slice bounds out of range [{low}:{high}] with length {len}")]
    SliceOutOfRange { low: u64, high: u64, len: u64 },

    /// 式の構文エラー
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// エントリに必要な属性がない
    #[error("entry at {offset} does not have a {attr} attribute")]
    MissingAttribute { offset: Offset, attr: &'static str },

    /// 不正なエントリ（存在しないオフセットへのシーク等）
    #[error("malformed debug info entry at {0}")]
    MalformedEntry(Offset),

    /// PCを含む関数が見つからない
    #[error("unable to find function context for pc 0x{0:x}")]
    FunctionNotFound(u64),

    /// サポートしていない型
    #[error("unsupported type {name} ({tag})")]
    UnsupportedType { name: String, tag: String },

    /// サポートしていないロケーション
    #[error("unsupported location for {0}")]
    UnsupportedLocation(String),
}
