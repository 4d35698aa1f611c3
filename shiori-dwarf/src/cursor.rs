//! デバッグ情報カーソル
//!
//! `DebugInfo` の上を深さ優先順に前進するステートフルなカーソルです。
//! 任意のオフセットへのシークと、兄弟エントリだけを対象にした走査を提供します。

use crate::{DebugEntry, DebugInfo, DwarfError, Offset, Result};

/// 走査モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// 現在の深さの兄弟だけを見る（子はすべて読み飛ばし、終端で停止）
    Siblings,
    /// すべての深さを見るが、関数本体の中には入らない
    SkipSubprograms,
}

/// デバッグ情報カーソル
pub struct EntryCursor<'a> {
    info: &'a DebugInfo,
    /// 次に読むエントリの位置
    pos: usize,
    /// 直前のシークが失敗していれば、そのオフセット
    bad_seek: Option<Offset>,
    depth: usize,
    /// 直前に返したエントリが子を持っていたか
    last_children: bool,
}

impl<'a> EntryCursor<'a> {
    /// 先頭を指すカーソルを作成する
    pub fn new(info: &'a DebugInfo) -> Self {
        Self {
            info,
            pos: 0,
            bad_seek: None,
            depth: 0,
            last_children: false,
        }
    }

    /// 現在の深さ
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// ストリームの先頭に戻る
    pub fn reset(&mut self) {
        self.pos = 0;
        self.bad_seek = None;
        self.depth = 0;
        self.last_children = false;
    }

    /// 任意のオフセットに移動する
    ///
    /// 存在しないオフセットの場合、次の `next` がエラーを返します。
    pub fn seek(&mut self, offset: Offset) {
        self.reset();
        match self.info.position(offset) {
            Some(pos) => self.pos = pos,
            None => self.bad_seek = Some(offset),
        }
    }

    /// エントリに移動し、そのエントリ自身を消費する
    ///
    /// 続く `next` はエントリの最初の子を返します。
    pub fn seek_to_entry(&mut self, entry: &DebugEntry) -> Result<()> {
        self.seek(entry.offset);
        self.next()?;
        Ok(())
    }

    /// 次のエントリを読む（終端エントリも返す）
    pub fn next(&mut self) -> Result<Option<DebugEntry>> {
        if let Some(offset) = self.bad_seek.take() {
            return Err(DwarfError::MalformedEntry(offset).into());
        }

        let Some(entry) = self.info.at(self.pos) else {
            self.last_children = false;
            return Ok(None);
        };
        self.pos += 1;

        if entry.children {
            self.depth += 1;
        } else if entry.is_terminator() {
            self.depth = self.depth.saturating_sub(1);
        }
        self.last_children = entry.children;

        Ok(Some(entry.clone()))
    }

    /// 直前に返したエントリの子を読み飛ばす
    ///
    /// 直前のエントリが子を持たない場合は何もしません。
    pub fn skip_children(&mut self) {
        if !self.last_children {
            return;
        }
        self.last_children = false;

        let mut level = 1usize;
        while level > 0 {
            let Some(entry) = self.info.at(self.pos) else {
                break;
            };
            self.pos += 1;
            if entry.children {
                level += 1;
            } else if entry.is_terminator() {
                level -= 1;
            }
        }
        self.depth = self.depth.saturating_sub(1);
    }

    /// PCを含む関数（`DW_TAG_subprogram`）を探す
    ///
    /// low_pc/high_pcのどちらかを持たない関数（宣言のみ等）は無視します。
    pub fn seek_to_function(&mut self, pc: u64) -> Result<DebugEntry> {
        self.reset();
        while let Some(entry) = self.next()? {
            if entry.tag != gimli::DW_TAG_subprogram {
                continue;
            }
            if entry.contains_pc(pc) {
                return Ok(entry);
            }
        }
        Err(DwarfError::FunctionNotFound(pc).into())
    }

    /// エントリの `DW_AT_type` が指す型に移動する
    ///
    /// typedefとポインタ型は、それぞれ解決しないよう指定された場合そこで止まります。
    /// 構造体に移動した場合は、続けて `next_member_variable` でメンバを列挙できます。
    pub fn seek_to_type(
        &mut self,
        entry: &DebugEntry,
        resolve_typedefs: bool,
        resolve_pointer_types: bool,
    ) -> Result<DebugEntry> {
        let mut offset = entry.type_offset().ok_or(DwarfError::MissingAttribute {
            offset: entry.offset,
            attr: "type",
        })?;

        loop {
            self.seek(offset);
            let type_entry = self.next()?.ok_or(DwarfError::MalformedEntry(offset))?;

            if type_entry.tag == gimli::DW_TAG_typedef && !resolve_typedefs {
                return Ok(type_entry);
            }
            if type_entry.tag == gimli::DW_TAG_pointer_type && !resolve_pointer_types {
                return Ok(type_entry);
            }
            // 配列や関数型のDW_AT_typeは要素型・戻り値型なので辿らない
            if !is_alias_like(type_entry.tag) {
                return Ok(type_entry);
            }

            match type_entry.type_offset() {
                Some(next) => offset = next,
                None => return Ok(type_entry),
            }
        }
    }

    /// 現在のスコープ直下の次のローカル変数・引数を返す
    pub fn next_scope_variable(&mut self) -> Result<Option<DebugEntry>> {
        self.next_sibling(|e| {
            e.tag == gimli::DW_TAG_variable || e.tag == gimli::DW_TAG_formal_parameter
        })
    }

    /// 現在の構造体直下の次のメンバを返す
    pub fn next_member_variable(&mut self) -> Result<Option<DebugEntry>> {
        self.next_sibling(|e| e.tag == gimli::DW_TAG_member)
    }

    /// 次のパッケージ変数（関数外で `DW_AT_external` を持つ変数）を返す
    pub fn next_package_variable(&mut self) -> Result<Option<DebugEntry>> {
        self.scan(ScanMode::SkipSubprograms, |e| {
            e.tag == gimli::DW_TAG_variable && e.is_external()
        })
    }

    /// 現在の深さの兄弟から条件に合う次のエントリを返す
    pub fn next_sibling<F>(&mut self, matches: F) -> Result<Option<DebugEntry>>
    where
        F: Fn(&DebugEntry) -> bool,
    {
        self.scan(ScanMode::Siblings, matches)
    }

    /// 走査の共通実装
    pub fn scan<F>(&mut self, mode: ScanMode, matches: F) -> Result<Option<DebugEntry>>
    where
        F: Fn(&DebugEntry) -> bool,
    {
        while let Some(entry) = self.next()? {
            match mode {
                ScanMode::Siblings => {
                    self.skip_children();
                    if entry.is_terminator() {
                        return Ok(None);
                    }
                }
                ScanMode::SkipSubprograms => {
                    if entry.tag == gimli::DW_TAG_subprogram {
                        self.skip_children();
                    }
                }
            }

            if matches(&entry) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// 別の型の別名として振る舞うタグか
fn is_alias_like(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_typedef
            | gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
    )
}
