//! 値デコード機能
//!
//! メモリから読み取ったバイト列を、型情報に基づいて適切にフォーマットします。

use crate::{DwarfError, MemoryReader, Offset, Result, TypeKind, TypeResolver};
use std::fmt;

/// デコード設定
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// ポインタを辿る最大深さ
    pub max_depth: usize,
    /// 配列/スライスの最大表示要素数
    pub max_array_elements: usize,
    /// 文字列の最大表示バイト数
    pub max_string_len: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_array_elements: 64,
            max_string_len: 4096,
        }
    }
}

/// デコード結果の表示値
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayValue {
    /// 符号付き整数
    Int(i64),
    /// 符号なし整数
    Uint(u64),
    /// float32
    Float32(f32),
    /// float64
    Float64(f64),
    /// complex64
    Complex64(f32, f32),
    /// complex128
    Complex128(f64, f64),
    /// 真偽値
    Bool(bool),
    /// 文字列
    Str { value: String, truncated: bool },
    /// 固定長配列
    Array {
        type_name: String,
        elements: Vec<DisplayValue>,
        truncated: bool,
    },
    /// スライス
    Slice {
        len: u64,
        cap: u64,
        elements: Vec<DisplayValue>,
        truncated: bool,
    },
    /// 構造体（フィールドは宣言順）
    Struct {
        name: String,
        fields: Vec<(String, DisplayValue)>,
    },
    /// ポインタ（`target` がなければアドレスのみ表示）
    Pointer {
        type_name: String,
        addr: u64,
        target: Option<Box<DisplayValue>>,
    },
}

impl DisplayValue {
    /// 型名を除いた値の本体
    ///
    /// ポインタの指す先を表示するときに使います。
    pub fn body(&self) -> String {
        match self {
            DisplayValue::Array {
                elements, truncated, ..
            } => bracketed(elements, *truncated),
            DisplayValue::Struct { fields, .. } => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|(name, value)| format!("{}: {}", name, value))
                    .collect();
                format!("{{{}}}", fields.join(", "))
            }
            other => other.to_string(),
        }
    }
}

fn bracketed(elements: &[DisplayValue], truncated: bool) -> String {
    let mut items: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
    if truncated {
        items.push("...".to_string());
    }
    format!("[{}]", items.join(" "))
}

fn complex<T: fmt::Display + PartialOrd + Default>(
    f: &mut fmt::Formatter<'_>,
    re: T,
    im: T,
) -> fmt::Result {
    if im < T::default() {
        write!(f, "({}{}i)", re, im)
    } else {
        write!(f, "({}+{}i)", re, im)
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayValue::Int(v) => write!(f, "{}", v),
            DisplayValue::Uint(v) => write!(f, "{}", v),
            DisplayValue::Float32(v) => write!(f, "{}", v),
            DisplayValue::Float64(v) => write!(f, "{}", v),
            DisplayValue::Complex64(re, im) => complex(f, *re, *im),
            DisplayValue::Complex128(re, im) => complex(f, *re, *im),
            DisplayValue::Bool(v) => write!(f, "{}", v),
            DisplayValue::Str { value, truncated } => {
                write!(f, "{}", value)?;
                if *truncated {
                    write!(f, "...")?;
                }
                Ok(())
            }
            DisplayValue::Array { type_name, .. } => write!(f, "{} {}", type_name, self.body()),
            DisplayValue::Slice {
                len,
                cap,
                elements,
                truncated,
            } => write!(f, "len: {} cap: {} {}", len, cap, bracketed(elements, *truncated)),
            DisplayValue::Struct { name, .. } => write!(f, "{} {}", name, self.body()),
            DisplayValue::Pointer {
                type_name,
                addr,
                target,
            } => match (addr, target) {
                (0, _) => write!(f, "{} nil", type_name),
                (_, Some(target)) => write!(f, "{} {}", type_name, target.body()),
                (addr, None) => write!(f, "{} 0x{:x}", type_name, addr),
            },
        }
    }
}

/// 値デコーダー
pub struct ValueDecoder<'a> {
    types: TypeResolver<'a>,
    memory: &'a dyn MemoryReader,
    config: &'a DecodeConfig,
}

impl<'a> ValueDecoder<'a> {
    pub fn new(
        types: TypeResolver<'a>,
        memory: &'a dyn MemoryReader,
        config: &'a DecodeConfig,
    ) -> Self {
        Self {
            types,
            memory,
            config,
        }
    }

    /// 型解決器への参照
    pub fn types(&self) -> &TypeResolver<'a> {
        &self.types
    }

    /// `addr` にある `type_offset` 型の値をデコードする
    pub fn decode(&self, type_offset: Offset, addr: u64) -> Result<DisplayValue> {
        self.decode_at(type_offset, addr, 0, None)
    }

    fn decode_at(
        &self,
        offset: Offset,
        addr: u64,
        depth: usize,
        alias: Option<&str>,
    ) -> Result<DisplayValue> {
        match self.types.kind(offset)? {
            TypeKind::Typedef { name, target } => self.decode_at(target, addr, depth, Some(&name)),
            TypeKind::Qualified { target } => self.decode_at(target, addr, depth, alias),
            TypeKind::Base {
                name,
                encoding,
                size,
            } => self.decode_base(&name, encoding, size, addr),
            TypeKind::Str => {
                let (value, truncated) = self.read_string(addr)?;
                Ok(DisplayValue::Str { value, truncated })
            }
            TypeKind::Slice { elem, .. } => self.decode_slice(offset, elem, addr, depth),
            TypeKind::Array { count, elem } => {
                let (elements, truncated) = self.decode_elements(elem, addr, count, depth)?;
                Ok(DisplayValue::Array {
                    type_name: self.types.type_name(offset)?,
                    elements,
                    truncated,
                })
            }
            TypeKind::Struct { name } => {
                let mut fields = Vec::new();
                for member in self.types.members(offset)? {
                    let value =
                        self.decode_at(member.type_offset, addr + member.offset, depth, None)?;
                    fields.push((member.name, value));
                }
                Ok(DisplayValue::Struct {
                    name: alias.map(str::to_string).unwrap_or(name),
                    fields,
                })
            }
            TypeKind::Pointer { pointee } => {
                let ptr = self.memory.read_u64(addr)?;
                let target = match pointee {
                    Some(pointee) if ptr != 0 && depth < self.config.max_depth => {
                        Some(Box::new(self.decode_at(pointee, ptr, depth + 1, None)?))
                    }
                    // nil、深さ上限、型なしポインタはアドレスだけ表示する
                    _ => None,
                };
                Ok(DisplayValue::Pointer {
                    type_name: self.types.type_name(offset)?,
                    addr: ptr,
                    target,
                })
            }
        }
    }

    fn decode_base(
        &self,
        name: &str,
        encoding: gimli::DwAte,
        size: u64,
        addr: u64,
    ) -> Result<DisplayValue> {
        let unsupported = || DwarfError::UnsupportedType {
            name: name.to_string(),
            tag: format!("{} ({} bytes)", encoding, size),
        };

        let value = match (encoding, size) {
            (gimli::DW_ATE_boolean, 1..=8) => {
                DisplayValue::Bool(self.memory.read_uint(addr, size as usize)? != 0)
            }
            (gimli::DW_ATE_signed | gimli::DW_ATE_signed_char, 1..=8) => {
                let raw = self.memory.read_uint(addr, size as usize)?;
                let shift = 64 - size * 8;
                DisplayValue::Int(((raw << shift) as i64) >> shift)
            }
            (gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char | gimli::DW_ATE_address, 1..=8) => {
                DisplayValue::Uint(self.memory.read_uint(addr, size as usize)?)
            }
            (gimli::DW_ATE_float, 4) => {
                DisplayValue::Float32(f32::from_bits(self.memory.read_uint(addr, 4)? as u32))
            }
            (gimli::DW_ATE_float, 8) => DisplayValue::Float64(f64::from_bits(self.memory.read_u64(addr)?)),
            (gimli::DW_ATE_complex_float, 8) => DisplayValue::Complex64(
                f32::from_bits(self.memory.read_uint(addr, 4)? as u32),
                f32::from_bits(self.memory.read_uint(addr + 4, 4)? as u32),
            ),
            (gimli::DW_ATE_complex_float, 16) => DisplayValue::Complex128(
                f64::from_bits(self.memory.read_u64(addr)?),
                f64::from_bits(self.memory.read_u64(addr + 8)?),
            ),
            _ => return Err(unsupported().into()),
        };

        Ok(value)
    }

    fn decode_slice(
        &self,
        offset: Offset,
        elem: Option<Offset>,
        addr: u64,
        depth: usize,
    ) -> Result<DisplayValue> {
        let field = |name: &str, default: u64| -> Result<u64> {
            Ok(self
                .types
                .member(offset, name)?
                .map(|m| m.offset)
                .unwrap_or(default))
        };
        let array = self.memory.read_u64(addr + field("array", 0)?)?;
        let len = self.memory.read_u64(addr + field("len", 8)?)?;
        let cap = self.memory.read_u64(addr + field("cap", 16)?)?;

        let (elements, truncated) = match elem {
            Some(elem) if array != 0 => self.decode_elements(elem, array, len, depth)?,
            _ => (Vec::new(), false),
        };

        Ok(DisplayValue::Slice {
            len,
            cap,
            elements,
            truncated,
        })
    }

    fn decode_elements(
        &self,
        elem: Offset,
        base: u64,
        count: u64,
        depth: usize,
    ) -> Result<(Vec<DisplayValue>, bool)> {
        let stride = self.types.byte_size(elem)?;
        let shown = count.min(self.config.max_array_elements as u64);

        let mut elements = Vec::with_capacity(shown as usize);
        for i in 0..shown {
            elements.push(self.decode_at(elem, base + i * stride, depth, None)?);
        }

        Ok((elements, shown < count))
    }

    /// 文字列ヘッダ（データポインタと長さ）を読む
    pub fn string_header(&self, addr: u64) -> Result<(u64, u64)> {
        let ptr = self.memory.read_u64(addr)?;
        let len = self.memory.read_u64(addr + 8)?;
        Ok((ptr, len))
    }

    /// 文字列の `[low, high)` バイトを読む
    pub fn read_string_range(&self, addr: u64, low: u64, high: u64) -> Result<String> {
        let (ptr, _) = self.string_header(addr)?;
        if high <= low {
            return Ok(String::new());
        }
        let bytes = self.memory.read(ptr + low, (high - low) as usize)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_string(&self, addr: u64) -> Result<(String, bool)> {
        let (_, len) = self.string_header(addr)?;
        let shown = len.min(self.config.max_string_len as u64);
        let value = self.read_string_range(addr, 0, shown)?;
        Ok((value, shown < len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo_bar(baz: i64, bur: &str) -> DisplayValue {
        DisplayValue::Struct {
            name: "main.FooBar".to_string(),
            fields: vec![
                ("Baz".to_string(), DisplayValue::Int(baz)),
                (
                    "Bur".to_string(),
                    DisplayValue::Str {
                        value: bur.to_string(),
                        truncated: false,
                    },
                ),
            ],
        }
    }

    #[test]
    fn test_struct_display() {
        assert_eq!(foo_bar(8, "word").to_string(), "main.FooBar {Baz: 8, Bur: word}");
    }

    #[test]
    fn test_pointer_display() {
        let ptr = DisplayValue::Pointer {
            type_name: "*main.FooBar".to_string(),
            addr: 0xc000010000,
            target: Some(Box::new(foo_bar(5, "strum"))),
        };
        assert_eq!(ptr.to_string(), "*main.FooBar {Baz: 5, Bur: strum}");

        let nil = DisplayValue::Pointer {
            type_name: "*main.FooBar".to_string(),
            addr: 0,
            target: None,
        };
        assert_eq!(nil.to_string(), "*main.FooBar nil");

        let deep = DisplayValue::Pointer {
            type_name: "*int".to_string(),
            addr: 0xc000010000,
            target: None,
        };
        assert_eq!(deep.to_string(), "*int 0xc000010000");
    }

    #[test]
    fn test_array_and_slice_display() {
        let array = DisplayValue::Array {
            type_name: "[2]int".to_string(),
            elements: vec![DisplayValue::Int(1), DisplayValue::Int(2)],
            truncated: false,
        };
        assert_eq!(array.to_string(), "[2]int [1 2]");
        assert_eq!(array.body(), "[1 2]");

        let slice = DisplayValue::Slice {
            len: 100,
            cap: 128,
            elements: vec![DisplayValue::Int(1), DisplayValue::Int(2)],
            truncated: true,
        };
        assert_eq!(slice.to_string(), "len: 100 cap: 128 [1 2 ...]");
    }

    #[test]
    fn test_float_display_is_shortest() {
        assert_eq!(DisplayValue::Float64(7.23).to_string(), "7.23");
        assert_eq!(DisplayValue::Float32(1.2).to_string(), "1.2");
        assert_eq!(DisplayValue::Complex128(1.0, -2.5).to_string(), "(1-2.5i)");
        assert_eq!(DisplayValue::Complex64(1.5, 2.0).to_string(), "(1.5+2i)");
    }
}
