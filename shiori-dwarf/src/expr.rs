//! 変数式のパース
//!
//! `name`, `name.member.member`, `name[lo:hi]` の形式を受け付けます。

use crate::{DwarfError, Result};
use regex::Regex;

/// 部分文字列の範囲（省略された端は `None`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub low: Option<u64>,
    pub high: Option<u64>,
}

impl SliceRange {
    /// 長さ `len` に対して範囲を確定する
    pub fn resolve(&self, len: u64) -> Result<(u64, u64)> {
        let low = self.low.unwrap_or(0);
        let high = self.high.unwrap_or(len);
        if low > high || high > len {
            return Err(DwarfError::SliceOutOfRange { low, high, len }.into());
        }
        Ok((low, high))
    }
}

/// パース済みの変数式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    /// 入力そのもの（評価結果の名前になる）
    pub text: String,
    /// `.` で区切られたセグメント
    pub path: Vec<String>,
    pub range: Option<SliceRange>,
}

/// 変数式パーサー
pub struct ExpressionParser {
    /// `expr[lo:hi]`
    slice_pattern: Regex,
    /// パスの1セグメント（Goのパッケージパスは `/` や `-` を含み得る）
    segment_pattern: Regex,
}

impl ExpressionParser {
    pub fn new() -> Result<Self> {
        let slice_pattern = Regex::new(r"^(.+)\[(\d*):(\d*)\]$")?;
        let segment_pattern = Regex::new(r"^[\p{L}_~][\p{L}\p{N}_/\-]*$")?;

        Ok(Self {
            slice_pattern,
            segment_pattern,
        })
    }

    /// 式をパースする
    pub fn parse(&self, text: &str) -> Result<Expression> {
        let text = text.trim();
        let invalid = || DwarfError::InvalidExpression(text.to_string());

        let (path, range) = match self.slice_pattern.captures(text) {
            Some(caps) => {
                let bound = |i: usize| -> Result<Option<u64>> {
                    match caps.get(i).map(|m| m.as_str()) {
                        None | Some("") => Ok(None),
                        Some(s) => Ok(Some(s.parse().map_err(|_| invalid())?)),
                    }
                };
                let range = SliceRange {
                    low: bound(2)?,
                    high: bound(3)?,
                };
                let path = caps.get(1).map(|m| m.as_str()).ok_or_else(invalid)?;
                (path, Some(range))
            }
            None => (text, None),
        };

        let path: Vec<String> = path.split('.').map(str::to_string).collect();
        if path.iter().any(|s| !self.segment_pattern.is_match(s)) {
            return Err(invalid().into());
        }

        Ok(Expression {
            text: text.to_string(),
            path,
            range,
        })
    }
}
