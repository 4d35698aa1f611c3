//! DWARF ロケーション式評価
//!
//! DWARFのロケーション式を評価して、変数のメモリ上の位置を特定します。

use crate::{FrameContext, MemoryReader, Result};
use gimli::{EndianSlice, EvaluationResult, LittleEndian, Location, Value};

/// ロケーション評価の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loc {
    /// レジスタに格納されている
    Reg { reg: u16 },
    /// メモリアドレス
    Addr { addr: u64 },
    /// 値そのもの（`DW_OP_stack_value` 等）
    Value { value: u64 },
    /// 最適化により削除された
    Empty,
}

/// ロケーション評価器
pub struct LocationEvaluator<'a> {
    frame: &'a FrameContext,
    memory: &'a dyn MemoryReader,
    encoding: gimli::Encoding,
}

impl<'a> LocationEvaluator<'a> {
    /// 新しいロケーション評価器を作成する
    ///
    /// # Arguments
    /// * `frame` - 停止位置のフレーム情報
    /// * `memory` - `DW_OP_deref` 等で使うメモリ
    /// * `encoding` - 式を含むユニットのエンコーディング
    pub fn new(
        frame: &'a FrameContext,
        memory: &'a dyn MemoryReader,
        encoding: gimli::Encoding,
    ) -> Self {
        Self {
            frame,
            memory,
            encoding,
        }
    }

    /// ロケーション式を評価する
    ///
    /// `frame_base` は `DW_OP_fbreg` で使われます。
    pub fn evaluate(&self, expr: &[u8], frame_base: Option<u64>) -> Result<Loc> {
        let expr = gimli::Expression(EndianSlice::new(expr, LittleEndian));
        let mut eval = expr.evaluation(self.encoding);

        let mut state = eval.evaluate()?;
        loop {
            state = match state {
                EvaluationResult::Complete => break,
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = self.frame.register(register.0)?;
                    eval.resume_with_register(Value::Generic(value))?
                }
                EvaluationResult::RequiresFrameBase => {
                    let fb = frame_base
                        .ok_or_else(|| anyhow::anyhow!("Frame base required but not provided"))?;
                    eval.resume_with_frame_base(fb)?
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    eval.resume_with_call_frame_cfa(self.frame.cfa)?
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let value = self.memory.read_uint(address, usize::from(size))?;
                    eval.resume_with_memory(Value::Generic(value))?
                }
                EvaluationResult::RequiresRelocatedAddress(address) => {
                    eval.resume_with_relocated_address(address.wrapping_add(self.frame.load_bias))?
                }
                other => {
                    return Err(anyhow::anyhow!(
                        "Unsupported evaluation result: {:?}",
                        other
                    ));
                }
            };
        }

        let pieces = eval.result();
        let piece = match pieces.as_slice() {
            [] => return Ok(Loc::Empty),
            [piece] => piece,
            _ => anyhow::bail!("Composite locations ({} pieces) are not supported", pieces.len()),
        };

        let loc = match piece.location {
            Location::Empty => Loc::Empty,
            Location::Register { register } => Loc::Reg { reg: register.0 },
            Location::Address { address } => Loc::Addr { addr: address },
            Location::Value { value } => Loc::Value {
                value: value.to_u64(u64::MAX)?,
            },
            ref other => anyhow::bail!("Unsupported location kind: {:?}", other),
        };

        Ok(loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_encoding;
    use std::collections::HashMap;

    struct NoMemory;

    impl MemoryReader for NoMemory {
        fn read(&self, addr: u64, _size: usize) -> Result<Vec<u8>> {
            anyhow::bail!("unexpected read at 0x{:x}", addr)
        }
    }

    fn frame() -> FrameContext {
        FrameContext {
            pc: 0x1000,
            cfa: 0x7fff_0000,
            load_bias: 0,
            registers: HashMap::from([(7, 0x7ffe_ff00)]),
        }
    }

    #[test]
    fn test_call_frame_cfa_plus_offset() {
        let frame = frame();
        let eval = LocationEvaluator::new(&frame, &NoMemory, default_encoding());

        // DW_OP_call_frame_cfa; DW_OP_consts -24; DW_OP_plus
        let loc = eval.evaluate(&[0x9c, 0x11, 0x68, 0x22], None).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0x7fff_0000 - 24 });
    }

    #[test]
    fn test_fbreg() {
        let frame = frame();
        let eval = LocationEvaluator::new(&frame, &NoMemory, default_encoding());

        // DW_OP_fbreg 16
        let loc = eval.evaluate(&[0x91, 0x10], Some(0x5000)).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0x5010 });

        assert!(eval.evaluate(&[0x91, 0x10], None).is_err());
    }

    #[test]
    fn test_addr_is_relocated() {
        let mut frame = frame();
        frame.load_bias = 0x5555_0000_0000;
        let eval = LocationEvaluator::new(&frame, &NoMemory, default_encoding());

        // DW_OP_addr 0x4000
        let mut expr = vec![0x03];
        expr.extend_from_slice(&0x4000u64.to_le_bytes());
        let loc = eval.evaluate(&expr, None).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0x5555_0000_4000 });
    }

    #[test]
    fn test_register_location() {
        let frame = frame();
        let eval = LocationEvaluator::new(&frame, &NoMemory, default_encoding());

        // DW_OP_reg0
        let loc = eval.evaluate(&[0x50], None).unwrap();
        assert_eq!(loc, Loc::Reg { reg: 0 });
    }
}
