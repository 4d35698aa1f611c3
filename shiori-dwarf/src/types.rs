//! 型エントリの分類と型名の描画
//!
//! DWARFの型タグを閉じた列挙 `TypeKind` に分類します。
//! Goの文字列とスライスは構造体として出力されるため、名前で区別します。

use crate::{DebugEntry, DebugInfo, DwarfError, Offset, Result};

/// 型の種類
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// 数値・真偽値などの基本型
    Base {
        name: String,
        encoding: gimli::DwAte,
        size: u64,
    },
    /// 文字列（`str` ポインタと `len` を持つ構造体）
    Str,
    /// スライス（`array`, `len`, `cap` を持つ構造体）
    Slice {
        name: String,
        /// 要素型（`array` メンバのポインタが指す型）
        elem: Option<Offset>,
    },
    /// 固定長配列
    Array { count: u64, elem: Offset },
    /// 構造体
    Struct { name: String },
    /// ポインタ（型なしポインタは `pointee` が `None`）
    Pointer { pointee: Option<Offset> },
    /// 名前付き型
    Typedef { name: String, target: Offset },
    /// const/volatile等の修飾
    Qualified { target: Offset },
}

/// 構造体メンバ
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    /// 構造体先頭からのバイトオフセット
    pub offset: u64,
    pub type_offset: Offset,
}

/// 型名描画時の再帰上限（自己参照型対策）
const MAX_NAME_DEPTH: usize = 32;

/// 型エントリの解決器
pub struct TypeResolver<'a> {
    info: &'a DebugInfo,
}

impl<'a> TypeResolver<'a> {
    pub fn new(info: &'a DebugInfo) -> Self {
        Self { info }
    }

    fn entry(&self, offset: Offset) -> Result<&'a DebugEntry> {
        Ok(self
            .info
            .entry(offset)
            .ok_or(DwarfError::MalformedEntry(offset))?)
    }

    fn type_of(entry: &DebugEntry) -> Result<Offset> {
        Ok(entry.type_offset().ok_or(DwarfError::MissingAttribute {
            offset: entry.offset,
            attr: "type",
        })?)
    }

    /// 型エントリを分類する
    pub fn kind(&self, offset: Offset) -> Result<TypeKind> {
        let entry = self.entry(offset)?;
        let name = entry.name().unwrap_or_default().to_string();

        let kind = match entry.tag {
            gimli::DW_TAG_base_type => TypeKind::Base {
                encoding: entry.encoding().ok_or(DwarfError::MissingAttribute {
                    offset,
                    attr: "encoding",
                })?,
                size: entry.byte_size().ok_or(DwarfError::MissingAttribute {
                    offset,
                    attr: "byte_size",
                })?,
                name,
            },
            gimli::DW_TAG_structure_type if name == "string" => TypeKind::Str,
            gimli::DW_TAG_structure_type if name.starts_with("[]") => {
                let elem = match self.member(offset, "array")? {
                    Some(array) => match self.kind(array.type_offset)? {
                        TypeKind::Pointer { pointee } => pointee,
                        _ => None,
                    },
                    None => None,
                };
                TypeKind::Slice { name, elem }
            }
            gimli::DW_TAG_structure_type => TypeKind::Struct { name },
            gimli::DW_TAG_array_type => TypeKind::Array {
                count: self.array_count(entry)?,
                elem: Self::type_of(entry)?,
            },
            gimli::DW_TAG_pointer_type => TypeKind::Pointer {
                pointee: entry.type_offset(),
            },
            gimli::DW_TAG_typedef => TypeKind::Typedef {
                target: Self::type_of(entry)?,
                name,
            },
            gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type => TypeKind::Qualified {
                target: Self::type_of(entry)?,
            },
            tag => {
                return Err(DwarfError::UnsupportedType {
                    name,
                    tag: tag.static_string().unwrap_or("unknown").to_string(),
                }
                .into())
            }
        };

        Ok(kind)
    }

    /// 名前付き型と修飾を剥がした実体の型
    pub fn underlying(&self, mut offset: Offset) -> Result<(Offset, TypeKind)> {
        for _ in 0..MAX_NAME_DEPTH {
            match self.kind(offset)? {
                TypeKind::Typedef { target, .. } | TypeKind::Qualified { target } => {
                    offset = target;
                }
                kind => return Ok((offset, kind)),
            }
        }
        Err(DwarfError::MalformedEntry(offset).into())
    }

    /// 型名を描画する
    ///
    /// 名前付き型はその名前、ポインタは `*` + 指す先の型名、
    /// 配列は `[N]` + 要素型名、構造体は `struct ` + 構造体名になります。
    pub fn type_name(&self, offset: Offset) -> Result<String> {
        self.type_name_at(offset, 0)
    }

    fn type_name_at(&self, offset: Offset, depth: usize) -> Result<String> {
        if depth > MAX_NAME_DEPTH {
            return Ok("...".to_string());
        }

        let name = match self.kind(offset)? {
            TypeKind::Base { name, .. } | TypeKind::Typedef { name, .. } => name,
            TypeKind::Str => "struct string".to_string(),
            TypeKind::Slice { name, .. } | TypeKind::Struct { name } => format!("struct {}", name),
            TypeKind::Array { count, elem } => {
                format!("[{}]{}", count, self.type_name_at(elem, depth + 1)?)
            }
            TypeKind::Pointer { pointee: Some(pointee) } => {
                format!("*{}", self.type_name_at(pointee, depth + 1)?)
            }
            TypeKind::Pointer { pointee: None } => "*void".to_string(),
            TypeKind::Qualified { target } => self.type_name_at(target, depth + 1)?,
        };

        Ok(name)
    }

    /// 型のバイトサイズ
    pub fn byte_size(&self, offset: Offset) -> Result<u64> {
        let entry = self.entry(offset)?;
        if let Some(size) = entry.byte_size() {
            return Ok(size);
        }

        let size = match self.kind(offset)? {
            TypeKind::Base { size, .. } => size,
            TypeKind::Str => 16,
            TypeKind::Slice { .. } => 24,
            TypeKind::Array { count, elem } => count * self.byte_size(elem)?,
            TypeKind::Pointer { .. } => self
                .info
                .encoding(entry.unit)
                .map(|e| u64::from(e.address_size))
                .unwrap_or(8),
            TypeKind::Typedef { target, .. } | TypeKind::Qualified { target } => {
                self.byte_size(target)?
            }
            TypeKind::Struct { .. } => {
                return Err(DwarfError::MissingAttribute {
                    offset,
                    attr: "byte_size",
                }
                .into())
            }
        };

        Ok(size)
    }

    /// 構造体のメンバを宣言順に列挙する
    pub fn members(&self, offset: Offset) -> Result<Vec<Member>> {
        let entry = self.entry(offset)?;
        let mut members = Vec::new();
        if !entry.children {
            return Ok(members);
        }

        let mut cursor = self.info.cursor();
        cursor.seek_to_entry(entry)?;
        while let Some(member) = cursor.next_member_variable()? {
            members.push(Member {
                name: member.name().unwrap_or_default().to_string(),
                offset: member.member_offset().unwrap_or(0),
                type_offset: Self::type_of(&member)?,
            });
        }

        Ok(members)
    }

    /// 名前でメンバを探す
    pub fn member(&self, offset: Offset, name: &str) -> Result<Option<Member>> {
        Ok(self.members(offset)?.into_iter().find(|m| m.name == name))
    }

    fn array_count(&self, array: &DebugEntry) -> Result<u64> {
        if array.children {
            let mut cursor = self.info.cursor();
            cursor.seek_to_entry(array)?;
            if let Some(subrange) =
                cursor.next_sibling(|e| e.tag == gimli::DW_TAG_subrange_type)?
            {
                if let Some(count) = subrange.subrange_count() {
                    return Ok(count);
                }
            }
        }

        Err(DwarfError::MissingAttribute {
            offset: array.offset,
            attr: "count",
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttrValue, DebugInfoBuilder};

    fn name(n: &str) -> (gimli::DwAt, AttrValue) {
        (gimli::DW_AT_name, AttrValue::Str(n.to_string()))
    }

    #[test]
    fn test_qualified_and_untyped_pointer_names() {
        let mut b = DebugInfoBuilder::new();
        b.entry(gimli::DW_TAG_compile_unit, vec![], true);
        let int = b.entry(
            gimli::DW_TAG_base_type,
            vec![
                name("int"),
                (gimli::DW_AT_encoding, AttrValue::Encoding(gimli::DW_ATE_signed)),
                (gimli::DW_AT_byte_size, AttrValue::Udata(8)),
            ],
            false,
        );
        let konst = b.entry(
            gimli::DW_TAG_const_type,
            vec![(gimli::DW_AT_type, AttrValue::Ref(int))],
            false,
        );
        let void_ptr = b.entry(gimli::DW_TAG_pointer_type, vec![], false);
        let subroutine = b.entry(gimli::DW_TAG_subroutine_type, vec![name("func()")], false);
        let info = b.build();
        let types = TypeResolver::new(&info);

        assert_eq!(types.type_name(konst).unwrap(), "int");
        assert_eq!(types.byte_size(konst).unwrap(), 8);
        assert_eq!(types.underlying(konst).unwrap().0, int);
        assert_eq!(types.type_name(void_ptr).unwrap(), "*void");
        assert_eq!(types.byte_size(void_ptr).unwrap(), 8);

        let err = types.kind(subroutine).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DwarfError>(),
            Some(DwarfError::UnsupportedType { .. })
        ));
    }
}
