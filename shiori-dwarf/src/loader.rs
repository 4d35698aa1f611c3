//! ELFとDWARFの読み込み機能

use crate::{CallFrameInfo, DebugInfo, Result};
use object::{Object, ObjectSection};
use std::fs;
use std::path::Path;

/// DWARFセクションのリーダー型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
pub struct DwarfLoader {
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfReader>,
    endian: gimli::RunTimeEndian,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // セッションの間ずっと参照するため'staticにする
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let dwarf = load_dwarf(&object_file, endian)?;
        tracing::info!(path = %path.display(), pie = matches!(object_file.kind(), object::ObjectKind::Dynamic), "binary loaded");

        Ok(Self {
            object_file,
            dwarf,
            endian,
        })
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// 同じセクションから新しいDWARFコンテキストを作る
    ///
    /// `addr2line::Context` のように所有権を要求する利用者向けです。
    pub fn load_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        load_dwarf(&self.object_file, self.endian)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 全エントリを平坦化したデバッグ情報を作る
    pub fn debug_info(&self) -> Result<DebugInfo> {
        DebugInfo::from_dwarf(&self.dwarf)
    }

    /// `.debug_frame` と `.eh_frame` からCFIを作る
    pub fn call_frame_info(&self) -> CallFrameInfo {
        let debug_frame = section_data(&self.object_file, ".debug_frame");
        let eh_frame = self.object_file.section_by_name(".eh_frame").and_then(|s| {
            let data = section_bytes(&s)?;
            Some((data, s.address()))
        });
        let text_addr = self
            .object_file
            .section_by_name(".text")
            .map(|s| s.address())
            .unwrap_or(0);

        CallFrameInfo::new(debug_frame, eh_frame, text_addr, self.endian)
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIE実行ファイルの場合、デバッグ情報のアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }
}

/// 圧縮セクション（SHF_COMPRESSED）も展開してデータを返す
fn section_bytes(section: &object::Section<'static, '_>) -> Option<&'static [u8]> {
    match section.uncompressed_data().ok()? {
        std::borrow::Cow::Borrowed(data) => Some(data),
        std::borrow::Cow::Owned(data) => Some(Box::leak(data.into_boxed_slice())),
    }
}

fn section_data(object_file: &object::File<'static>, name: &str) -> Option<&'static [u8]> {
    object_file
        .section_by_name(name)
        .and_then(|section| section_bytes(&section))
}

fn load_dwarf(
    object_file: &object::File<'static>,
    endian: gimli::RunTimeEndian,
) -> Result<gimli::Dwarf<DwarfReader>> {
    let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
        let data = section_data(object_file, id.name()).unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    };

    gimli::Dwarf::load(load_section)
        .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
