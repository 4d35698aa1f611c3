//! 停止中スレッドの評価コンテキスト

use crate::Result;
use shiori_dwarf::{
    DebugInfo, DecodeConfig, FrameContext, LineInfo, LineInfoProvider, MemoryReader, Variable,
    VariableEvaluator,
};
use shiori_target::ThreadId;

/// 停止中のスレッドから見た変数評価の入り口
///
/// 作成時点のレジスタとCFAを保持し、以後の評価はすべてこのフレームで行います。
pub struct ThreadContext<'a> {
    tid: ThreadId,
    frame: FrameContext,
    info: &'a DebugInfo,
    lines: &'a LineInfoProvider,
    memory: &'a dyn MemoryReader,
    config: &'a DecodeConfig,
}

impl<'a> ThreadContext<'a> {
    pub fn new(
        tid: ThreadId,
        frame: FrameContext,
        info: &'a DebugInfo,
        lines: &'a LineInfoProvider,
        memory: &'a dyn MemoryReader,
        config: &'a DecodeConfig,
    ) -> Self {
        Self {
            tid,
            frame,
            info,
            lines,
            memory,
            config,
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// 実行時のPC
    pub fn pc(&self) -> u64 {
        self.frame.pc.wrapping_add(self.frame.load_bias)
    }

    pub fn frame(&self) -> &FrameContext {
        &self.frame
    }

    /// 停止位置のソース行
    pub fn location(&self) -> Result<Option<LineInfo>> {
        self.lines.pc_to_line(self.frame.pc)
    }

    fn evaluator(&self) -> Result<VariableEvaluator<'_>> {
        VariableEvaluator::new(self.info, self.memory, &self.frame, self.config)
    }

    /// 式を評価する
    pub fn eval_symbol(&self, name: &str) -> Result<Variable> {
        self.evaluator()?.eval_symbol(name)
    }

    /// 現在の関数のローカル変数（順序は不定）
    pub fn local_variables(&self) -> Result<Vec<Variable>> {
        self.evaluator()?.local_variables()
    }

    /// 現在の関数の引数（順序は不定）
    pub fn function_arguments(&self) -> Result<Vec<Variable>> {
        self.evaluator()?.function_arguments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiori_dwarf::{AttrValue, DebugInfoBuilder, LineRow};
    use std::collections::HashMap;

    struct Stack(HashMap<u64, u8>);

    impl MemoryReader for Stack {
        fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
            (addr..addr + size as u64)
                .map(|a| {
                    self.0
                        .get(&a)
                        .copied()
                        .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", a))
                })
                .collect()
        }
    }

    #[test]
    fn test_evaluates_in_captured_frame() {
        let mut b = DebugInfoBuilder::new();
        b.entry(
            gimli::DW_TAG_compile_unit,
            vec![(gimli::DW_AT_name, AttrValue::Str("main".to_string()))],
            true,
        );
        let int = b.entry(
            gimli::DW_TAG_base_type,
            vec![
                (gimli::DW_AT_name, AttrValue::Str("int".to_string())),
                (gimli::DW_AT_encoding, AttrValue::Encoding(gimli::DW_ATE_signed)),
                (gimli::DW_AT_byte_size, AttrValue::Udata(8)),
            ],
            false,
        );
        b.entry(
            gimli::DW_TAG_subprogram,
            vec![
                (gimli::DW_AT_name, AttrValue::Str("main.main".to_string())),
                (gimli::DW_AT_low_pc, AttrValue::Addr(0x401000)),
                (gimli::DW_AT_high_pc, AttrValue::Addr(0x401100)),
            ],
            true,
        );
        b.entry(
            gimli::DW_TAG_variable,
            vec![
                (gimli::DW_AT_name, AttrValue::Str("n".to_string())),
                (gimli::DW_AT_type, AttrValue::Ref(int)),
                // DW_OP_call_frame_cfa; DW_OP_consts -8; DW_OP_plus
                (gimli::DW_AT_location, AttrValue::Expr(vec![0x9c, 0x11, 0x78, 0x22])),
            ],
            false,
        );
        b.end_children();
        let info = b.build();

        let bytes = 7i64.to_le_bytes();
        let memory = Stack((0..8).map(|i| (0x7000 - 8 + i as u64, bytes[i])).collect());
        let lines = LineInfoProvider::from_rows(
            vec![LineRow {
                file: "/src/main.go".to_string(),
                line: 7,
                address: 0x401010,
                is_stmt: true,
            }],
            &info,
        );
        let config = DecodeConfig::default();
        let frame = FrameContext {
            pc: 0x401010,
            cfa: 0x7000,
            load_bias: 0,
            registers: HashMap::new(),
        };

        let ctx = ThreadContext::new(42, frame, &info, &lines, &memory, &config);
        assert_eq!(ctx.tid(), 42);
        assert_eq!(ctx.pc(), 0x401010);

        let n = ctx.eval_symbol("n").unwrap();
        assert_eq!(n.to_string(), "n = 7");
        assert_eq!(ctx.local_variables().unwrap(), vec![n]);
        assert!(ctx.function_arguments().unwrap().is_empty());
        assert!(ctx.eval_symbol("m").is_err());
    }
}
