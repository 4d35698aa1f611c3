//! シンボル解決機能
//!
//! ELFのシンボルテーブルから関数名とアドレスを対応付けます。

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// シンボルテーブル上の名前
    pub name: String,
    /// デマングル後の名前（Goのシンボルはそのまま）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    fn contains(&self, addr: u64) -> bool {
        self.address <= addr && (addr < self.address + self.size || self.size == 0)
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{:#}", demangled),
        Err(_) => name.to_string(),
    }
}

/// シンボル解決
pub struct SymbolResolver {
    /// 名前（マングル名・デマングル名の両方） -> `functions` の添字
    by_name: HashMap<String, usize>,
    /// アドレス順の関数シンボル
    functions: Vec<Symbol>,
}

impl SymbolResolver {
    /// 実行ファイルのシンボルテーブルから作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let symbols = loader
            .object_file()
            .symbols()
            .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                (!name.is_empty()).then(|| Symbol::new(name.to_string(), s.address(), s.size()))
            })
            .collect();

        Ok(Self::from_symbols(symbols))
    }

    /// シンボルの一覧から作成する
    pub fn from_symbols(mut functions: Vec<Symbol>) -> Self {
        functions.sort_by_key(|s| s.address);

        let mut by_name = HashMap::new();
        for (i, sym) in functions.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(i);
            by_name.entry(sym.demangled_name.clone()).or_insert(i);
        }
        tracing::debug!(functions = functions.len(), "symbol table loaded");

        Self { by_name, functions }
    }

    /// 関数名からアドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.lookup(name).map(|s| s.address)
    }

    /// 関数名からシンボルを探す
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    /// アドレスを含む関数シンボルを返す
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.functions.partition_point(|s| s.address <= addr);
        let sym = self.functions.get(idx.checked_sub(1)?)?;
        sym.contains(addr).then_some(sym)
    }

    /// すべての関数シンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.functions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols(vec![
            Symbol::new("main.main".to_string(), 0x401200, 0x80),
            Symbol::new("main.foobar".to_string(), 0x401000, 0x100),
            Symbol::new("_ZN4core3fmt5write17h0123456789abcdefE".to_string(), 0x402000, 0x40),
        ])
    }

    #[test]
    fn test_resolve_by_name() {
        let symbols = resolver();
        assert_eq!(symbols.resolve("main.foobar"), Some(0x401000));
        assert_eq!(symbols.resolve("core::fmt::write"), Some(0x402000));
        assert_eq!(symbols.resolve("main.nope"), None);
    }

    #[test]
    fn test_reverse_resolve() {
        let symbols = resolver();
        assert_eq!(
            symbols.reverse_resolve(0x401010).map(|s| s.name.as_str()),
            Some("main.foobar")
        );
        assert_eq!(
            symbols.reverse_resolve(0x401200).map(|s| s.name.as_str()),
            Some("main.main")
        );
        assert!(symbols.reverse_resolve(0x401150).is_none());
        assert!(symbols.reverse_resolve(0x400000).is_none());
    }
}
