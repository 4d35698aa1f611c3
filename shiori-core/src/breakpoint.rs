//! ブレークポイント管理

use crate::{DebuggerError, Result};
use shiori_dwarf::MemoryReader;
use shiori_target::{MemoryWriter, SoftwareBreakpoint};
use std::collections::BTreeMap;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    /// 実行時アドレス
    pub address: u64,
    /// 設定時に指定された位置（`file:line` やシンボル名）
    pub location: Option<String>,
    pub hit_count: usize,
}

/// ブレークポイントマネージャ
///
/// 論理的なブレークポイント情報とソフトウェアブレークポイント（INT3）を
/// アドレスをキーにして一緒に管理します。1アドレスにつき1つだけです。
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, (Breakpoint, SoftwareBreakpoint)>,
    next_id: BreakpointId,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// ブレークポイントを追加し、有効化する
    ///
    /// 既に同じアドレスにある場合は `AlreadySet` で失敗し、退避済みのバイトはそのまま残ります。
    pub fn add_and_enable<M>(
        &mut self,
        address: u64,
        location: Option<String>,
        memory: &M,
    ) -> Result<&Breakpoint>
    where
        M: MemoryReader + MemoryWriter + ?Sized,
    {
        if self.breakpoints.contains_key(&address) {
            return Err(DebuggerError::AlreadySet(address).into());
        }

        let mut sw_bp = SoftwareBreakpoint::new(address);
        sw_bp.enable(memory)?;

        let id = self.next_id;
        self.next_id += 1;
        let bp = Breakpoint {
            id,
            address,
            location,
            hit_count: 0,
        };
        tracing::info!(id, address = format!("0x{:x}", address), "breakpoint set");

        let (bp, _) = self.breakpoints.entry(address).or_insert((bp, sw_bp));
        Ok(bp)
    }

    /// ブレークポイントを削除し、元のバイトを復元する
    pub fn remove_and_disable<M>(&mut self, address: u64, memory: &M) -> Result<Breakpoint>
    where
        M: MemoryWriter + ?Sized,
    {
        let (_, sw_bp) = self
            .breakpoints
            .get_mut(&address)
            .ok_or(DebuggerError::NotFound(address))?;
        sw_bp.disable(memory)?;

        let (bp, _) = self
            .breakpoints
            .remove(&address)
            .ok_or(DebuggerError::NotFound(address))?;
        tracing::info!(id = bp.id, address = format!("0x{:x}", address), "breakpoint cleared");
        Ok(bp)
    }

    /// IDからアドレスを引く
    pub fn address_of(&self, id: BreakpointId) -> Result<u64> {
        self.breakpoints
            .values()
            .find(|(bp, _)| bp.id == id)
            .map(|(bp, _)| bp.address)
            .ok_or_else(|| DebuggerError::UnknownBreakpoint(id).into())
    }

    /// アドレスのブレークポイントを取得する
    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address).map(|(bp, _)| bp)
    }

    /// 有効なブレークポイントがあるか
    pub fn is_enabled_at(&self, address: u64) -> bool {
        self.breakpoints
            .get(&address)
            .is_some_and(|(_, sw_bp)| sw_bp.is_enabled())
    }

    /// 全てのブレークポイントをID順に取得する
    pub fn all(&self) -> Vec<&Breakpoint> {
        let mut all: Vec<_> = self.breakpoints.values().map(|(bp, _)| bp).collect();
        all.sort_by_key(|bp| bp.id);
        all
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// ヒット回数を加算する
    pub fn record_hit(&mut self, address: u64) {
        if let Some((bp, _)) = self.breakpoints.get_mut(&address) {
            bp.hit_count += 1;
        }
    }

    /// ステップオーバーのため一時的に元の命令へ戻す
    pub fn suspend<M>(&mut self, address: u64, memory: &M) -> Result<()>
    where
        M: MemoryWriter + ?Sized,
    {
        let (_, sw_bp) = self
            .breakpoints
            .get_mut(&address)
            .ok_or(DebuggerError::NotFound(address))?;
        sw_bp.disable(memory)
    }

    /// 一時解除したトラップを再設置する
    pub fn reinstall<M>(&mut self, address: u64, memory: &M) -> Result<()>
    where
        M: MemoryReader + MemoryWriter + ?Sized,
    {
        let (_, sw_bp) = self
            .breakpoints
            .get_mut(&address)
            .ok_or(DebuggerError::NotFound(address))?;
        sw_bp.enable(memory)
    }

    /// すべて解除して元のバイトを復元する
    ///
    /// 途中で失敗しても残りの復元を試み、最初のエラーを返します。
    pub fn clear_all<M>(&mut self, memory: &M) -> Result<()>
    where
        M: MemoryWriter + ?Sized,
    {
        let mut first_error = None;
        for (_, (bp, mut sw_bp)) in std::mem::take(&mut self.breakpoints) {
            if let Err(e) = sw_bp.disable(memory) {
                tracing::warn!(id = bp.id, error = %e, "could not restore breakpoint");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// プロセス終了後にメモリへ触れず破棄する
    pub fn forget_all(&mut self) {
        self.breakpoints.clear();
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}
