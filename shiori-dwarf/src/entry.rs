//! デバッグ情報エントリのアリーナ
//!
//! `.debug_info` の全エントリを深さ優先順に平坦化して保持します。
//! 子リストの終わりには明示的な終端エントリ（`DW_TAG_null`）を置くため、
//! カーソルはツリーを構築せずにシークと逐次読み出しだけで走査できます。

use crate::Result;
use gimli::Reader;
use std::collections::HashMap;
use std::fmt;

/// `.debug_info` セクション内のバイトオフセット
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub usize);

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// 属性値（gimliの値を所有型に変換したもの）
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// アドレス
    Addr(u64),
    /// 符号なし定数
    Udata(u64),
    /// 符号付き定数
    Sdata(i64),
    /// フラグ
    Flag(bool),
    /// 他のエントリへの参照
    Ref(Offset),
    /// 文字列
    Str(String),
    /// DWARF式（ロケーション式等）
    Expr(Vec<u8>),
    /// 基本型のエンコーディング
    Encoding(gimli::DwAte),
    /// アドレス範囲リスト（`DW_AT_ranges`）
    Ranges(Vec<(u64, u64)>),
    /// 未対応の形式
    Other,
}

/// デバッグ情報エントリのスナップショット
///
/// カーソルから返されるのは値のコピーであり、カーソル内部への参照ではありません。
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEntry {
    /// エントリのオフセット（終端エントリの場合は閉じている親のオフセット）
    pub offset: Offset,
    /// タグ（終端エントリは `DW_TAG_null`）
    pub tag: gimli::DwTag,
    /// 子エントリを持つか
    pub children: bool,
    /// 所属するコンパイルユニットの番号
    pub unit: usize,
    attrs: HashMap<gimli::DwAt, AttrValue>,
}

impl DebugEntry {
    /// エントリを作成する
    pub fn new(
        offset: Offset,
        tag: gimli::DwTag,
        children: bool,
        unit: usize,
        attrs: Vec<(gimli::DwAt, AttrValue)>,
    ) -> Self {
        Self {
            offset,
            tag,
            children,
            unit,
            attrs: attrs.into_iter().collect(),
        }
    }

    /// 子リストの終端エントリかどうか
    pub fn is_terminator(&self) -> bool {
        self.tag == gimli::DW_TAG_null
    }

    /// 属性値を取得する
    pub fn val(&self, at: gimli::DwAt) -> Option<&AttrValue> {
        self.attrs.get(&at)
    }

    /// `DW_AT_name`
    pub fn name(&self) -> Option<&str> {
        match self.val(gimli::DW_AT_name)? {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `DW_AT_type` が指すエントリのオフセット
    pub fn type_offset(&self) -> Option<Offset> {
        match self.val(gimli::DW_AT_type)? {
            AttrValue::Ref(offset) => Some(*offset),
            _ => None,
        }
    }

    /// `DW_AT_low_pc`
    pub fn low_pc(&self) -> Option<u64> {
        match self.val(gimli::DW_AT_low_pc)? {
            AttrValue::Addr(addr) => Some(*addr),
            _ => None,
        }
    }

    /// `DW_AT_high_pc`（オフセット形式の場合はlow_pcを加算する）
    pub fn high_pc(&self) -> Option<u64> {
        match self.val(gimli::DW_AT_high_pc)? {
            AttrValue::Addr(addr) => Some(*addr),
            AttrValue::Udata(len) => self.low_pc().map(|low| low + len),
            _ => None,
        }
    }

    /// PCがこのエントリの `[low_pc, high_pc)` または `DW_AT_ranges` に含まれるか
    pub fn contains_pc(&self, pc: u64) -> bool {
        if let (Some(low), Some(high)) = (self.low_pc(), self.high_pc()) {
            return low <= pc && pc < high;
        }
        match self.val(gimli::DW_AT_ranges) {
            Some(AttrValue::Ranges(ranges)) => {
                ranges.iter().any(|&(begin, end)| begin <= pc && pc < end)
            }
            _ => false,
        }
    }

    /// `DW_AT_external`
    pub fn is_external(&self) -> bool {
        matches!(self.val(gimli::DW_AT_external), Some(AttrValue::Flag(true)))
    }

    /// `DW_AT_byte_size`
    pub fn byte_size(&self) -> Option<u64> {
        self.constant(gimli::DW_AT_byte_size)
    }

    /// `DW_AT_encoding`
    pub fn encoding(&self) -> Option<gimli::DwAte> {
        match self.val(gimli::DW_AT_encoding)? {
            AttrValue::Encoding(ate) => Some(*ate),
            AttrValue::Udata(v) => Some(gimli::DwAte(*v as u8)),
            _ => None,
        }
    }

    /// `DW_AT_location` の式
    pub fn location(&self) -> Option<&[u8]> {
        self.expr(gimli::DW_AT_location)
    }

    /// `DW_AT_frame_base` の式
    pub fn frame_base(&self) -> Option<&[u8]> {
        self.expr(gimli::DW_AT_frame_base)
    }

    /// 構造体メンバのバイトオフセット
    ///
    /// 定数形式と `DW_OP_plus_uconst` の式形式の両方を受け付けます。
    pub fn member_offset(&self) -> Option<u64> {
        match self.val(gimli::DW_AT_data_member_location)? {
            AttrValue::Udata(v) => Some(*v),
            AttrValue::Sdata(v) => u64::try_from(*v).ok(),
            AttrValue::Expr(bytes) => {
                let mut data = gimli::EndianSlice::new(bytes, gimli::LittleEndian);
                if data.read_u8().ok()? != gimli::DW_OP_plus_uconst.0 {
                    return None;
                }
                data.read_uleb128().ok()
            }
            _ => None,
        }
    }

    /// 配列の要素数（`DW_TAG_subrange_type` の `DW_AT_count` または `DW_AT_upper_bound`）
    pub fn subrange_count(&self) -> Option<u64> {
        if let Some(count) = self.constant(gimli::DW_AT_count) {
            return Some(count);
        }
        match self.val(gimli::DW_AT_upper_bound)? {
            AttrValue::Udata(upper) => Some(upper + 1),
            // 要素数0の配列は上限 -1 で表される
            AttrValue::Sdata(upper) => Some((*upper + 1).max(0) as u64),
            _ => None,
        }
    }

    fn constant(&self, at: gimli::DwAt) -> Option<u64> {
        match self.val(at)? {
            AttrValue::Udata(v) => Some(*v),
            AttrValue::Sdata(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn expr(&self, at: gimli::DwAt) -> Option<&[u8]> {
        match self.val(at)? {
            AttrValue::Expr(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// 平坦化されたデバッグ情報エントリ列
#[derive(Debug, Default)]
pub struct DebugInfo {
    entries: Vec<DebugEntry>,
    index: HashMap<Offset, usize>,
    encodings: Vec<gimli::Encoding>,
}

impl DebugInfo {
    /// gimliのDWARFコンテキストから全ユニットのエントリを読み込む
    pub fn from_dwarf<R: Reader<Offset = usize>>(dwarf: &gimli::Dwarf<R>) -> Result<Self> {
        let mut builder = DebugInfoBuilder::new();

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            builder.begin_unit(unit.encoding());

            let mut entries = unit.entries();
            while entries.next_entry()?.is_some() {
                let Some(entry) = entries.current() else {
                    builder.end_children();
                    continue;
                };

                let offset = entry
                    .offset()
                    .to_debug_info_offset(&unit.header)
                    .ok_or_else(|| anyhow::anyhow!("Entry is not in .debug_info"))?;

                let mut attrs = Vec::new();
                let mut iter = entry.attrs();
                while let Some(attr) = iter.next()? {
                    attrs.push((attr.name(), convert_attr(dwarf, &unit, attr.value())?));
                }

                builder.entry_at(Offset(offset.0), entry.tag(), attrs, entry.has_children());
            }
        }

        let info = builder.build();
        tracing::debug!(
            entries = info.len(),
            units = info.encodings.len(),
            "debug info loaded"
        );
        Ok(info)
    }

    /// エントリ数（終端エントリを含む）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// エントリが空かどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// オフセットからエントリを取得する
    pub fn entry(&self, offset: Offset) -> Option<&DebugEntry> {
        self.position(offset).and_then(|pos| self.entries.get(pos))
    }

    /// ユニットのエンコーディングを取得する
    pub fn encoding(&self, unit: usize) -> Option<gimli::Encoding> {
        self.encodings.get(unit).copied()
    }

    /// 新しいカーソルを作成する
    pub fn cursor(&self) -> crate::EntryCursor<'_> {
        crate::EntryCursor::new(self)
    }

    pub(crate) fn position(&self, offset: Offset) -> Option<usize> {
        self.index.get(&offset).copied()
    }

    pub(crate) fn at(&self, pos: usize) -> Option<&DebugEntry> {
        self.entries.get(pos)
    }
}

/// gimliの属性値を所有型に変換する
fn convert_attr<R: Reader<Offset = usize>>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    value: gimli::AttributeValue<R>,
) -> Result<AttrValue> {
    use gimli::AttributeValue as V;

    let converted = match value {
        V::Addr(_) | V::DebugAddrIndex(_) => match dwarf.attr_address(unit, value)? {
            Some(addr) => AttrValue::Addr(addr),
            None => AttrValue::Other,
        },
        V::UnitRef(offset) => match offset.to_debug_info_offset(&unit.header) {
            Some(global) => AttrValue::Ref(Offset(global.0)),
            None => AttrValue::Other,
        },
        V::DebugInfoRef(offset) => AttrValue::Ref(Offset(offset.0)),
        V::RangeListsRef(_) | V::DebugRngListsIndex(_) => {
            match dwarf.attr_ranges_offset(unit, value)? {
                Some(offset) => {
                    let mut ranges = Vec::new();
                    let mut iter = dwarf.ranges(unit, offset)?;
                    while let Some(range) = iter.next()? {
                        ranges.push((range.begin, range.end));
                    }
                    AttrValue::Ranges(ranges)
                }
                None => AttrValue::Other,
            }
        }
        V::Flag(flag) => AttrValue::Flag(flag),
        V::Sdata(v) => AttrValue::Sdata(v),
        V::Encoding(ate) => AttrValue::Encoding(ate),
        V::Exprloc(expr) => AttrValue::Expr(expr.0.to_slice()?.into_owned()),
        V::Block(block) => AttrValue::Expr(block.to_slice()?.into_owned()),
        V::String(_)
        | V::DebugStrRef(_)
        | V::DebugStrOffsetsIndex(_)
        | V::DebugLineStrRef(_) => {
            let s = dwarf.attr_string(unit, value)?;
            AttrValue::Str(s.to_string_lossy()?.into_owned())
        }
        other => match other.udata_value() {
            Some(v) => AttrValue::Udata(v),
            None => AttrValue::Other,
        },
    };

    Ok(converted)
}

/// `DebugInfo` を逐次構築するビルダー
///
/// ローダーはgimliから読んだエントリを、テストは合成したエントリを積みます。
#[derive(Debug, Default)]
pub struct DebugInfoBuilder {
    entries: Vec<DebugEntry>,
    index: HashMap<Offset, usize>,
    encodings: Vec<gimli::Encoding>,
    open: Vec<Offset>,
    next_offset: usize,
}

impl DebugInfoBuilder {
    /// 新しいビルダーを作成する
    pub fn new() -> Self {
        Self {
            next_offset: 0x0b,
            ..Default::default()
        }
    }

    /// 新しいコンパイルユニットを開始する
    pub fn begin_unit(&mut self, encoding: gimli::Encoding) -> usize {
        self.close_all();
        self.encodings.push(encoding);
        self.encodings.len() - 1
    }

    /// オフセットを自動採番してエントリを追加する
    pub fn entry(
        &mut self,
        tag: gimli::DwTag,
        attrs: Vec<(gimli::DwAt, AttrValue)>,
        children: bool,
    ) -> Offset {
        let offset = Offset(self.next_offset);
        self.entry_at(offset, tag, attrs, children);
        offset
    }

    /// 指定したオフセットでエントリを追加する
    pub fn entry_at(
        &mut self,
        offset: Offset,
        tag: gimli::DwTag,
        attrs: Vec<(gimli::DwAt, AttrValue)>,
        children: bool,
    ) {
        if self.encodings.is_empty() {
            self.encodings.push(default_encoding());
        }
        let unit = self.encodings.len() - 1;

        self.index.insert(offset, self.entries.len());
        self.entries
            .push(DebugEntry::new(offset, tag, children, unit, attrs));
        self.next_offset = self.next_offset.max(offset.0 + 1);

        if children {
            self.open.push(offset);
        }
    }

    /// 直近に開いた子リストを終端エントリで閉じる
    pub fn end_children(&mut self) {
        let Some(parent) = self.open.pop() else {
            return;
        };
        let unit = self.encodings.len().saturating_sub(1);
        self.entries.push(DebugEntry::new(
            parent,
            gimli::DW_TAG_null,
            false,
            unit,
            Vec::new(),
        ));
    }

    /// 構築を完了する
    pub fn build(mut self) -> DebugInfo {
        self.close_all();
        DebugInfo {
            entries: self.entries,
            index: self.index,
            encodings: self.encodings,
        }
    }

    fn close_all(&mut self) {
        while !self.open.is_empty() {
            self.end_children();
        }
    }
}

/// 64bit DWARF4 のエンコーディング
pub fn default_encoding() -> gimli::Encoding {
    gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_closes_child_lists() {
        let mut builder = DebugInfoBuilder::new();
        let cu = builder.entry(gimli::DW_TAG_compile_unit, vec![], true);
        let var = builder.entry(
            gimli::DW_TAG_variable,
            vec![(gimli::DW_AT_name, AttrValue::Str("x".into()))],
            false,
        );
        let info = builder.build();

        assert_eq!(info.len(), 3);
        assert_eq!(info.entry(var).and_then(|e| e.name()), Some("x"));
        let terminator = info.at(2).unwrap();
        assert!(terminator.is_terminator());
        assert_eq!(terminator.offset, cu);
        assert!(info.entry(Offset(0x999)).is_none());
    }

    #[test]
    fn test_member_offset_forms() {
        let constant = DebugEntry::new(
            Offset(1),
            gimli::DW_TAG_member,
            false,
            0,
            vec![(gimli::DW_AT_data_member_location, AttrValue::Udata(16))],
        );
        assert_eq!(constant.member_offset(), Some(16));

        // DW_OP_plus_uconst 200 (ULEB128: 0xc8 0x01)
        let expr = DebugEntry::new(
            Offset(2),
            gimli::DW_TAG_member,
            false,
            0,
            vec![(
                gimli::DW_AT_data_member_location,
                AttrValue::Expr(vec![0x23, 0xc8, 0x01]),
            )],
        );
        assert_eq!(expr.member_offset(), Some(200));
    }

    #[test]
    fn test_high_pc_as_length() {
        let entry = DebugEntry::new(
            Offset(1),
            gimli::DW_TAG_subprogram,
            true,
            0,
            vec![
                (gimli::DW_AT_low_pc, AttrValue::Addr(0x1000)),
                (gimli::DW_AT_high_pc, AttrValue::Udata(0x20)),
            ],
        );
        assert_eq!(entry.high_pc(), Some(0x1020));
        assert!(entry.contains_pc(0x1000));
        assert!(entry.contains_pc(0x101f));
        assert!(!entry.contains_pc(0x1020));
    }

    #[test]
    fn test_contains_pc_with_ranges() {
        let block = DebugEntry::new(
            Offset(1),
            gimli::DW_TAG_lexical_block,
            true,
            0,
            vec![(
                gimli::DW_AT_ranges,
                AttrValue::Ranges(vec![(0x1000, 0x1010), (0x1040, 0x1050)]),
            )],
        );
        assert!(block.contains_pc(0x1008));
        assert!(block.contains_pc(0x1040));
        assert!(!block.contains_pc(0x1020));
    }

    #[test]
    fn test_subrange_count() {
        let upper = DebugEntry::new(
            Offset(1),
            gimli::DW_TAG_subrange_type,
            false,
            0,
            vec![(gimli::DW_AT_upper_bound, AttrValue::Udata(1))],
        );
        assert_eq!(upper.subrange_count(), Some(2));

        let empty = DebugEntry::new(
            Offset(2),
            gimli::DW_TAG_subrange_type,
            false,
            0,
            vec![(gimli::DW_AT_upper_bound, AttrValue::Sdata(-1))],
        );
        assert_eq!(empty.subrange_count(), Some(0));
    }
}
