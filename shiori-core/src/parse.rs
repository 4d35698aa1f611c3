//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use shiori_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// ブレークポイントの設定位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// 実行時アドレス
    Address(u64),
    /// ソースファイルと行番号
    Line { file: String, line: u64 },
    /// 関数名
    Symbol(String),
}

/// `break` の引数をパースする
///
/// `0x401000`、`testvariables.go:39`、`main.foobar` の形式を受け付けます。
pub fn parse_location(s: &str) -> Result<Location> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty location");
    }

    if s.starts_with("0x") || s.starts_with("0X") || s.bytes().all(|b| b.is_ascii_digit()) {
        return parse_address(s).map(Location::Address);
    }

    if let Some((file, line)) = s.rsplit_once(':') {
        let line = line
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid line number in '{}': {}", s, e))?;
        if file.is_empty() || line == 0 {
            anyhow::bail!("Invalid source location '{}'", s);
        }
        return Ok(Location::Line {
            file: file.to_string(),
            line,
        });
    }

    Ok(Location::Symbol(s.to_string()))
}

/// `clear` の対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointRef {
    Id(usize),
    Address(u64),
}

/// `clear` の引数をパースする（`0x` 付きはアドレス、それ以外はID）
pub fn parse_breakpoint_ref(s: &str) -> Result<BreakpointRef> {
    let s = s.trim();
    if s.starts_with("0x") || s.starts_with("0X") {
        return parse_address(s).map(BreakpointRef::Address);
    }
    s.parse::<usize>()
        .map(BreakpointRef::Id)
        .map_err(|e| anyhow::anyhow!("Invalid breakpoint '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xabcd").unwrap(), 0xabcd);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
        assert_eq!(parse_address(" 9999 ").unwrap(), 9999);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("0x401000").unwrap(), Location::Address(0x401000));
        assert_eq!(parse_location("4198400").unwrap(), Location::Address(4198400));
        assert_eq!(
            parse_location("testvariables.go:39").unwrap(),
            Location::Line {
                file: "testvariables.go".to_string(),
                line: 39
            }
        );
        assert_eq!(
            parse_location("/src/app/main.go:12").unwrap(),
            Location::Line {
                file: "/src/app/main.go".to_string(),
                line: 12
            }
        );
        assert_eq!(
            parse_location("main.foobar").unwrap(),
            Location::Symbol("main.foobar".to_string())
        );
    }

    #[test]
    fn test_parse_location_invalid() {
        assert!(parse_location("").is_err());
        assert!(parse_location("main.go:abc").is_err());
        assert!(parse_location("main.go:0").is_err());
        assert!(parse_location(":12").is_err());
    }

    #[test]
    fn test_parse_breakpoint_ref() {
        assert_eq!(parse_breakpoint_ref("2").unwrap(), BreakpointRef::Id(2));
        assert_eq!(
            parse_breakpoint_ref("0x401000").unwrap(),
            BreakpointRef::Address(0x401000)
        );
        assert!(parse_breakpoint_ref("main").is_err());
    }
}
