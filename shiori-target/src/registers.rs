//! レジスタアクセス機能

use crate::Result;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;
use shiori_dwarf::regs;
use std::collections::HashMap;

/// スレッドのレジスタ
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: i32) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.tid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// DWARFレジスタ番号で引けるレジスタ表を作る
    pub fn dwarf_registers(&self) -> Result<HashMap<u16, u64>> {
        Ok(dwarf_register_map(&self.read()?))
    }
}

/// `user_regs_struct` をDWARFレジスタ番号に対応付ける
pub fn dwarf_register_map(r: &user_regs_struct) -> HashMap<u16, u64> {
    HashMap::from([
        (regs::RAX, r.rax),
        (regs::RDX, r.rdx),
        (regs::RCX, r.rcx),
        (regs::RBX, r.rbx),
        (regs::RSI, r.rsi),
        (regs::RDI, r.rdi),
        (regs::RBP, r.rbp),
        (regs::RSP, r.rsp),
        (regs::R8, r.r8),
        (regs::R9, r.r9),
        (regs::R10, r.r10),
        (regs::R11, r.r11),
        (regs::R12, r.r12),
        (regs::R13, r.r13),
        (regs::R14, r.r14),
        (regs::R15, r.r15),
        (regs::RIP, r.rip),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dwarf_register_map() {
        // SAFETY: user_regs_struct は整数フィールドのみ
        let mut r: user_regs_struct = unsafe { std::mem::zeroed() };
        r.rax = 1;
        r.rdx = 2;
        r.rsp = 0x7fff_0000;
        r.rbp = 0x7fff_0100;
        r.r15 = 15;
        r.rip = 0x401000;

        let map = dwarf_register_map(&r);
        assert_eq!(map[&regs::RAX], 1);
        assert_eq!(map[&regs::RDX], 2);
        assert_eq!(map[&regs::RSP], 0x7fff_0000);
        assert_eq!(map[&regs::RBP], 0x7fff_0100);
        assert_eq!(map[&regs::R15], 15);
        assert_eq!(map[&regs::RIP], 0x401000);
        assert_eq!(map.len(), 17);
    }
}
