//! 停止位置のフレーム情報とCFA計算

use crate::Result;
use gimli::UnwindSection;
use std::collections::HashMap;

type Slice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// x86-64のDWARFレジスタ番号
pub mod regs {
    pub const RAX: u16 = 0;
    pub const RDX: u16 = 1;
    pub const RCX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSI: u16 = 4;
    pub const RDI: u16 = 5;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const R8: u16 = 8;
    pub const R9: u16 = 9;
    pub const R10: u16 = 10;
    pub const R11: u16 = 11;
    pub const R12: u16 = 12;
    pub const R13: u16 = 13;
    pub const R14: u16 = 14;
    pub const R15: u16 = 15;
    pub const RIP: u16 = 16;
}

/// 変数評価に使う停止位置の情報
#[derive(Debug, Clone, Default)]
pub struct FrameContext {
    /// デバッグ情報上のPC（ロードバイアスを引いた値）
    pub pc: u64,
    /// Canonical Frame Address
    pub cfa: u64,
    /// PIEのロードバイアス（非PIEなら0）
    pub load_bias: u64,
    /// DWARFレジスタ番号 -> 値
    pub registers: HashMap<u16, u64>,
}

impl FrameContext {
    /// レジスタ値を取得する
    pub fn register(&self, reg: u16) -> Result<u64> {
        self.registers
            .get(&reg)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Register {} is not available", reg))
    }
}

/// コールフレーム情報（`.debug_frame` / `.eh_frame`）
pub struct CallFrameInfo {
    debug_frame: Option<gimli::DebugFrame<Slice>>,
    eh_frame: Option<gimli::EhFrame<Slice>>,
    bases: gimli::BaseAddresses,
}

impl CallFrameInfo {
    /// セクションデータからCFIを構築する
    ///
    /// `eh_frame_addr` と `text_addr` はセクションの仮想アドレスです。
    pub fn new(
        debug_frame: Option<&'static [u8]>,
        eh_frame: Option<(&'static [u8], u64)>,
        text_addr: u64,
        endian: gimli::RunTimeEndian,
    ) -> Self {
        let mut bases = gimli::BaseAddresses::default().set_text(text_addr);

        let debug_frame = debug_frame.map(|data| {
            let mut section = gimli::DebugFrame::from(gimli::EndianSlice::new(data, endian));
            section.set_address_size(8);
            section
        });
        let eh_frame = eh_frame.map(|(data, addr)| {
            bases = std::mem::take(&mut bases).set_eh_frame(addr);
            let mut section = gimli::EhFrame::from(gimli::EndianSlice::new(data, endian));
            section.set_address_size(8);
            section
        });

        Self {
            debug_frame,
            eh_frame,
            bases,
        }
    }

    /// CFIを持たない空の情報
    pub fn empty() -> Self {
        Self {
            debug_frame: None,
            eh_frame: None,
            bases: gimli::BaseAddresses::default(),
        }
    }

    /// PCにおけるCFAを計算する
    ///
    /// `pc` はデバッグ情報上のアドレス、`registers` は実行時のレジスタ値です。
    /// CFIが見つからない場合はフレームポインタ規約（rbp + 16）を使います。
    pub fn cfa(&self, pc: u64, registers: &HashMap<u16, u64>) -> Result<u64> {
        let rule = self.cfa_rule(pc);

        match rule {
            Some((register, offset)) => {
                let base = registers
                    .get(&register)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Register {} is not available", register))?;
                Ok(base.wrapping_add_signed(offset))
            }
            None => {
                tracing::debug!("no CFI rule for pc 0x{:x}, using rbp + 16", pc);
                let rbp = registers
                    .get(&regs::RBP)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Register rbp is not available"))?;
                Ok(rbp.wrapping_add(16))
            }
        }
    }

    fn cfa_rule(&self, pc: u64) -> Option<(u16, i64)> {
        let mut ctx = gimli::UnwindContext::new();

        if let Some(section) = &self.debug_frame {
            if let Ok(row) = section.unwind_info_for_address(
                &self.bases,
                &mut ctx,
                pc,
                gimli::DebugFrame::cie_from_offset,
            ) {
                if let gimli::CfaRule::RegisterAndOffset { register, offset } = row.cfa() {
                    return Some((register.0, *offset));
                }
            }
        }

        if let Some(section) = &self.eh_frame {
            if let Ok(row) = section.unwind_info_for_address(
                &self.bases,
                &mut ctx,
                pc,
                gimli::EhFrame::cie_from_offset,
            ) {
                if let gimli::CfaRule::RegisterAndOffset { register, offset } = row.cfa() {
                    return Some((register.0, *offset));
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfa_falls_back_to_frame_pointer() {
        let cfi = CallFrameInfo::empty();
        let registers = HashMap::from([(regs::RBP, 0x7fff_1000), (regs::RSP, 0x7fff_0f00)]);

        assert_eq!(cfi.cfa(0x401000, &registers).unwrap(), 0x7fff_1010);
        assert!(cfi.cfa(0x401000, &HashMap::new()).is_err());
    }

    #[test]
    fn test_frame_register_lookup() {
        let frame = FrameContext {
            registers: HashMap::from([(regs::RIP, 0x401000)]),
            ..Default::default()
        };
        assert_eq!(frame.register(regs::RIP).unwrap(), 0x401000);
        assert!(frame.register(regs::RAX).is_err());
    }
}
