//! メモリアクセス機能

use crate::{Result, TargetError};
use nix::unistd::Pid;
use shiori_dwarf::MemoryReader;
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};

/// メモリ書き込みトレイト
///
/// ブレークポイントの命令書き換えはこのトレイト経由で行います。
pub trait MemoryWriter {
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// メモリマッピング情報（`/proc/<pid>/maps` の1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング先のファイル内オフセット
    pub offset: u64,
    pub path: Option<String>,
}

impl MemoryMapping {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// `/proc/<pid>/maps` の内容を解析する
///
/// 形式: `address perms offset dev inode pathname`
pub fn parse_maps(text: &str) -> Result<Vec<MemoryMapping>> {
    let mut mappings = Vec::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            continue;
        };
        let start = u64::from_str_radix(start, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse start address in '{}': {}", line, e))?;
        let end = u64::from_str_radix(end, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse end address in '{}': {}", line, e))?;
        let offset = u64::from_str_radix(parts[2], 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse offset in '{}': {}", line, e))?;

        let perms = parts[1].as_bytes();
        mappings.push(MemoryMapping {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            path: parts.get(5).map(|p| p.to_string()),
        });
    }

    Ok(mappings)
}

/// 実行ファイルのロードバイアスを求める
///
/// 実行ファイル自身のオフセット0のマッピング先頭がバイアスになります。
/// パスが一致しない場合は最初の実行可能セグメントから逆算します。
pub fn load_bias(mappings: &[MemoryMapping], exe: Option<&str>) -> Option<u64> {
    if let Some(exe) = exe {
        let base = mappings
            .iter()
            .find(|m| m.offset == 0 && m.path.as_deref() == Some(exe));
        if let Some(m) = base {
            return Some(m.start);
        }
    }

    mappings
        .iter()
        .find(|m| m.executable)
        .map(|m| m.start.saturating_sub(m.offset))
}

/// 被デバッグプロセスのメモリ
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/mem が読めない場合は PTRACE_PEEKDATA にフォールバックします。
    pub fn read_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                tracing::trace!(addr = format!("0x{:x}", addr), size, error = %e, "proc mem read failed, trying ptrace");
                self.read_via_ptrace(addr, size)
                    .map_err(|_| TargetError::MemoryAccess { addr, len: size }.into())
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATA でワード単位に読み取る
    fn read_via_ptrace(&self, addr: u64, size: usize) -> nix::Result<Vec<u8>> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut data = Vec::with_capacity(size + word_size);

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset as u64) as ptrace::AddressType;
            let word = ptrace::read(self.pid, word_addr)?;
            data.extend_from_slice(&word.to_ne_bytes());
        }

        data.truncate(size);
        Ok(data)
    }

    /// メモリにデータを書き込む
    ///
    /// テキストセグメントのように書き込み不可のページでも /proc/pid/mem は書けますが、
    /// 失敗した場合は PTRACE_POKEDATA で書き込みます。
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.write_via_proc_mem(addr, data) {
            tracing::trace!(addr = format!("0x{:x}", addr), error = %e, "proc mem write failed, trying ptrace");
            self.write_via_ptrace(addr, data)
                .map_err(|_| TargetError::MemoryAccess {
                    addr,
                    len: data.len(),
                })?;
        }
        Ok(())
    }

    fn write_via_proc_mem(&self, addr: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data)
    }

    /// 端数のワードは読み込んだ値と合成してから書き込む
    fn write_via_ptrace(&self, addr: u64, data: &[u8]) -> nix::Result<()> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        for (i, chunk) in data.chunks(word_size).enumerate() {
            let word_addr = (addr + (i * word_size) as u64) as ptrace::AddressType;
            let mut bytes = ptrace::read(self.pid, word_addr)?.to_ne_bytes();
            bytes[..chunk.len()].copy_from_slice(chunk);
            let word = nix::libc::c_long::from_ne_bytes(bytes);
            ptrace::write(self.pid, word_addr, word)?;
        }
        Ok(())
    }

    /// メモリマッピング一覧を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let path = format!("/proc/{}/maps", self.pid);
        let text = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;
        parse_maps(&text)
    }

    /// 指定アドレスがマッピング内にあるか
    pub fn is_mapped(&self, addr: u64) -> Result<bool> {
        Ok(self.mappings()?.iter().any(|m| m.contains(addr)))
    }

    /// PIE実行ファイルのロードバイアスを取得する
    pub fn load_bias(&self) -> Result<u64> {
        let exe = fs::read_link(format!("/proc/{}/exe", self.pid))
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        let mappings = self.mappings()?;

        load_bias(&mappings, exe.as_deref()).ok_or_else(|| {
            anyhow::anyhow!("Could not find executable segment in memory mappings")
        })
    }
}

impl MemoryReader for Memory {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.read_bytes(addr, size)
    }
}

impl MemoryWriter for Memory {
    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(addr, data)
    }
}
