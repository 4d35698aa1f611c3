//! ソース行情報
//!
//! ファイル名と行番号からPCを、PCからファイル名と行番号を引きます。

use crate::{DebugInfo, DwarfLoader, DwarfReader, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    /// 囲んでいる関数名
    pub function: Option<String>,
}

/// 行テーブルの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRow {
    pub file: String,
    pub line: u64,
    pub address: u64,
    pub is_stmt: bool,
}

/// `LineToPC` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAddress {
    pub pc: u64,
    pub function: Option<String>,
}

/// 関数のアドレス範囲
#[derive(Debug, Clone)]
struct FunctionRange {
    low: u64,
    high: u64,
    name: String,
}

/// ソース行情報の取得
pub struct LineInfoProvider {
    rows: Vec<LineRow>,
    functions: Vec<FunctionRange>,
    context: Option<addr2line::Context<DwarfReader>>,
}

impl LineInfoProvider {
    /// バイナリの行テーブルと関数範囲から作成する
    pub fn new(loader: &DwarfLoader, info: &DebugInfo) -> Result<Self> {
        let rows = read_rows(loader.dwarf())?;
        let context = addr2line::Context::from_dwarf(loader.load_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build addr2line context: {}", e))?;

        tracing::debug!(rows = rows.len(), "line table loaded");
        Ok(Self {
            rows,
            functions: function_ranges(info),
            context: Some(context),
        })
    }

    /// 行テーブルを直接与えて作成する（addr2lineを使わない）
    pub fn from_rows(rows: Vec<LineRow>, info: &DebugInfo) -> Self {
        Self {
            rows,
            functions: function_ranges(info),
            context: None,
        }
    }

    /// ファイルと行番号からPCを求める
    ///
    /// `file` は行テーブルのフルパス、または `/` 区切りの末尾部分に一致します。
    /// その行の `is_stmt` アドレスのうち最小のものを返し、コードがない行は `None` です。
    pub fn line_to_pc(&self, file: &str, line: u64) -> Option<LineAddress> {
        let pc = self
            .rows
            .iter()
            .filter(|row| row.is_stmt && row.line == line && file_matches(&row.file, file))
            .map(|row| row.address)
            .min()?;

        Some(LineAddress {
            pc,
            function: self.function_name(pc),
        })
    }

    /// PCからソース行を求める
    pub fn pc_to_line(&self, pc: u64) -> Result<Option<LineInfo>> {
        let location = match &self.context {
            Some(context) => context
                .find_location(pc)
                .map_err(|e| anyhow::anyhow!("Failed to look up 0x{:x}: {}", pc, e))?
                .and_then(|loc| {
                    Some((loc.file?.to_string(), loc.line?, loc.column))
                }),
            None => self.row_for_pc(pc).map(|row| (row.file.clone(), row.line as u32, None)),
        };

        Ok(location.map(|(file, line, column)| LineInfo {
            file,
            line,
            column,
            function: self.function_name(pc),
        }))
    }

    /// PCを含む関数名
    pub fn function_name(&self, pc: u64) -> Option<String> {
        self.functions
            .iter()
            .find(|f| f.low <= pc && pc < f.high)
            .map(|f| f.name.clone())
    }

    fn row_for_pc(&self, pc: u64) -> Option<&LineRow> {
        self.rows
            .iter()
            .filter(|row| row.address <= pc)
            .max_by_key(|row| row.address)
    }
}

fn file_matches(full: &str, query: &str) -> bool {
    full == query
        || full
            .strip_suffix(query)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

fn function_ranges(info: &DebugInfo) -> Vec<FunctionRange> {
    let mut functions = Vec::new();
    let mut cursor = info.cursor();
    while let Ok(Some(entry)) = cursor.next() {
        if entry.tag != gimli::DW_TAG_subprogram {
            continue;
        }
        if let (Some(low), Some(high), Some(name)) = (entry.low_pc(), entry.high_pc(), entry.name())
        {
            functions.push(FunctionRange {
                low,
                high,
                name: name.to_string(),
            });
        }
    }
    functions
}

/// 全ユニットの行番号プログラムを実行して行テーブルを得る
fn read_rows(dwarf: &gimli::Dwarf<DwarfReader>) -> Result<Vec<LineRow>> {
    let mut rows = Vec::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };

        let mut state = program.rows();
        while let Some((header, row)) = state.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let (Some(line), Some(file)) = (row.line(), row.file(header)) else {
                continue;
            };

            let mut path = String::new();
            if let Some(dir) = file.directory(header) {
                path.push_str(&dwarf.attr_string(&unit, dir)?.to_string_lossy());
            }
            let name = dwarf.attr_string(&unit, file.path_name())?;
            let name = name.to_string_lossy();
            if name.starts_with('/') || path.is_empty() {
                path = name.into_owned();
            } else {
                path = format!("{}/{}", path.trim_end_matches('/'), name);
            }

            rows.push(LineRow {
                file: path,
                line: line.get(),
                address: row.address(),
                is_stmt: row.is_stmt(),
            });
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttrValue, DebugInfoBuilder};

    fn row(line: u64, address: u64, is_stmt: bool) -> LineRow {
        LineRow {
            file: "/home/user/src/shiori/fixtures/testvariables.go".to_string(),
            line,
            address,
            is_stmt,
        }
    }

    fn provider() -> LineInfoProvider {
        let mut b = DebugInfoBuilder::new();
        b.entry(gimli::DW_TAG_compile_unit, vec![], true);
        b.entry(
            gimli::DW_TAG_subprogram,
            vec![
                (gimli::DW_AT_name, AttrValue::Str("main.foobar".to_string())),
                (gimli::DW_AT_low_pc, AttrValue::Addr(0x401000)),
                (gimli::DW_AT_high_pc, AttrValue::Udata(0x100)),
            ],
            false,
        );
        let info = b.build();

        LineInfoProvider::from_rows(
            vec![
                row(47, 0x401020, false),
                row(47, 0x401030, true),
                row(47, 0x401028, true),
                row(48, 0x401040, true),
            ],
            &info,
        )
    }

    #[test]
    fn test_line_to_pc_picks_lowest_stmt() {
        let lines = provider();
        let found = lines.line_to_pc("testvariables.go", 47).unwrap();
        assert_eq!(found.pc, 0x401028);
        assert_eq!(found.function.as_deref(), Some("main.foobar"));

        assert!(lines.line_to_pc("fixtures/testvariables.go", 48).is_some());
        assert!(lines.line_to_pc("variables.go", 47).is_none());
        assert!(lines.line_to_pc("testvariables.go", 12).is_none());
    }

    #[test]
    fn test_pc_to_line_from_rows() {
        let lines = provider();
        let info = lines.pc_to_line(0x401044).unwrap().unwrap();
        assert_eq!(info.line, 48);
        assert_eq!(info.function.as_deref(), Some("main.foobar"));
        assert!(lines.pc_to_line(0x400000).unwrap().is_none());
    }
}
