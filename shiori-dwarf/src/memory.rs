//! 被デバッグプロセスのメモリ読み取り

use crate::Result;

/// メモリ読み取りトレイト
///
/// 変数評価器はこのトレイト経由でのみ対象プロセスのメモリを読みます。
/// 実プロセス向けの実装は `shiori-target` が提供します。
pub trait MemoryReader {
    /// 任意のアドレスから `size` バイト読み取る
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// リトルエンディアンの符号なし整数を読み取る（1〜8バイト）
    fn read_uint(&self, addr: u64, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            anyhow::bail!("Invalid integer size {} at 0x{:x}", size, addr);
        }
        let bytes = self.read(addr, size)?;
        if bytes.len() < size {
            anyhow::bail!("Short read at 0x{:x}: {} of {} bytes", addr, bytes.len(), size);
        }
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[..size]);
        Ok(u64::from_le_bytes(buf))
    }

    /// 8バイトの値（ポインタ等）を読み取る
    fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_uint(addr, 8)
    }
}
