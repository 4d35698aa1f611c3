//! ブレークポイント機能

use crate::{MemoryWriter, Result, TargetError};
use shiori_dwarf::MemoryReader;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
///
/// 有効化時に退避した元のバイトは、無効化されるまで上書きされません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: Option<u8>,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: None,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 退避した元のバイトを取得する
    pub fn original_byte(&self) -> Option<u8> {
        self.original_byte
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable<M>(&mut self, memory: &M) -> Result<()>
    where
        M: MemoryReader + MemoryWriter + ?Sized,
    {
        if self.enabled {
            return Ok(());
        }

        let bad_address = |_: anyhow::Error| TargetError::BadAddress(self.address);
        let saved = memory.read(self.address, 1).map_err(bad_address)?;
        let &byte = saved.first().ok_or(TargetError::BadAddress(self.address))?;
        memory
            .write(self.address, &[INT3_OPCODE])
            .map_err(bad_address)?;

        // 再有効化のときも最初に退避した値を保つ
        self.original_byte.get_or_insert(byte);
        self.enabled = true;
        tracing::debug!(address = format!("0x{:x}", self.address), "breakpoint installed");
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable<M>(&mut self, memory: &M) -> Result<()>
    where
        M: MemoryWriter + ?Sized,
    {
        if !self.enabled {
            return Ok(());
        }
        let Some(byte) = self.original_byte else {
            return Ok(());
        };

        memory
            .write(self.address, &[byte])
            .map_err(|_| TargetError::BadAddress(self.address))?;

        self.enabled = false;
        tracing::debug!(address = format!("0x{:x}", self.address), "breakpoint removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// テキスト領域だけを持つメモリ
    struct FakeText {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl FakeText {
        fn new(base: u64, code: &[u8]) -> Self {
            let bytes = code
                .iter()
                .enumerate()
                .map(|(i, &b)| (base + i as u64, b))
                .collect();
            Self {
                bytes: RefCell::new(bytes),
            }
        }

        fn byte(&self, addr: u64) -> u8 {
            self.bytes.borrow()[&addr]
        }
    }

    impl MemoryReader for FakeText {
        fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
            let bytes = self.bytes.borrow();
            (addr..addr + size as u64)
                .map(|a| {
                    bytes
                        .get(&a)
                        .copied()
                        .ok_or_else(|| anyhow::Error::from(TargetError::MemoryAccess { addr: a, len: 1 }))
                })
                .collect()
        }
    }

    impl MemoryWriter for FakeText {
        fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
            let mut bytes = self.bytes.borrow_mut();
            for (i, &b) in data.iter().enumerate() {
                let a = addr + i as u64;
                let slot = bytes
                    .get_mut(&a)
                    .ok_or(TargetError::MemoryAccess { addr: a, len: 1 })?;
                *slot = b;
            }
            Ok(())
        }
    }

    #[test]
    fn test_enable_disable_restores_byte() {
        let memory = FakeText::new(0x401000, &[0x55, 0x48, 0x89, 0xe5]);
        let mut bp = SoftwareBreakpoint::new(0x401001);

        bp.enable(&memory).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(bp.original_byte(), Some(0x48));
        assert_eq!(memory.byte(0x401001), INT3_OPCODE);

        bp.disable(&memory).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(memory.byte(0x401001), 0x48);
    }

    #[test]
    fn test_enable_twice_keeps_original_byte() {
        let memory = FakeText::new(0x401000, &[0x55]);
        let mut bp = SoftwareBreakpoint::new(0x401000);

        bp.enable(&memory).unwrap();
        bp.enable(&memory).unwrap();
        assert_eq!(bp.original_byte(), Some(0x55));

        bp.disable(&memory).unwrap();
        assert_eq!(memory.byte(0x401000), 0x55);
    }

    #[test]
    fn test_reenable_after_step_over() {
        let memory = FakeText::new(0x401000, &[0x55]);
        let mut bp = SoftwareBreakpoint::new(0x401000);

        for _ in 0..3 {
            bp.enable(&memory).unwrap();
            assert_eq!(memory.byte(0x401000), INT3_OPCODE);
            bp.disable(&memory).unwrap();
            assert_eq!(memory.byte(0x401000), 0x55);
        }
    }

    #[test]
    fn test_enable_unmapped_address() {
        let memory = FakeText::new(0x401000, &[0x55]);
        let mut bp = SoftwareBreakpoint::new(0x10);

        let err = bp.enable(&memory).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TargetError>(),
            Some(&TargetError::BadAddress(0x10))
        );
        assert!(!bp.is_enabled());
        assert_eq!(err.to_string(), "could not insert breakpoint at 0x10");
    }
}
