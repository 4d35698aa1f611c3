//! 変数評価
//!
//! 停止位置のPCとフレーム情報から変数名を解決し、値を読み取って描画します。
//! ローカル変数・引数は関数と、PCを含むレキシカルブロックから探し、
//! 見つからなければパッケージ変数を探します。

use crate::{
    default_encoding, DebugEntry, DebugInfo, DecodeConfig, DwarfError, Expression,
    ExpressionParser, FrameContext, Loc, LocationEvaluator, MemoryReader, Offset, Result,
    TypeKind, TypeResolver, ValueDecoder,
};
use std::fmt;

/// 評価結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// 評価した式（`a6.Baz` 等）
    pub name: String,
    /// 描画された型名
    pub type_name: String,
    /// 描画された値
    pub value: String,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/// PCから見えるスコープ
struct Scope {
    function: DebugEntry,
    /// 内側の宣言で隠されたものを除いた変数・引数
    variables: Vec<DebugEntry>,
}

/// 名前解決の結果
struct Resolved {
    entry: DebugEntry,
    frame_base: Option<u64>,
    /// 式のパスのうち変数名として消費したセグメント数
    consumed: usize,
}

/// 変数評価器
pub struct VariableEvaluator<'a> {
    info: &'a DebugInfo,
    memory: &'a dyn MemoryReader,
    frame: &'a FrameContext,
    config: &'a DecodeConfig,
    parser: ExpressionParser,
}

impl<'a> VariableEvaluator<'a> {
    pub fn new(
        info: &'a DebugInfo,
        memory: &'a dyn MemoryReader,
        frame: &'a FrameContext,
        config: &'a DecodeConfig,
    ) -> Result<Self> {
        Ok(Self {
            info,
            memory,
            frame,
            config,
            parser: ExpressionParser::new()?,
        })
    }

    fn types(&self) -> TypeResolver<'a> {
        TypeResolver::new(self.info)
    }

    fn decoder(&self) -> ValueDecoder<'a> {
        ValueDecoder::new(self.types(), self.memory, self.config)
    }

    /// 式を評価する
    pub fn eval_symbol(&self, text: &str) -> Result<Variable> {
        let expr = self.parser.parse(text)?;
        tracing::debug!(expr = %expr.text, pc = self.frame.pc, "eval symbol");

        let resolved = self
            .resolve(&expr)?
            .ok_or_else(|| DwarfError::SymbolNotFound(expr.text.clone()))?;

        let mut addr = self.address_of(&resolved.entry, resolved.frame_base)?;
        let mut type_offset = type_of(&resolved.entry)?;
        let mut base = expr.path[..resolved.consumed].join(".");

        for member in &expr.path[resolved.consumed..] {
            (type_offset, addr) = self.member_access(&base, type_offset, addr, member)?;
            base.push('.');
            base.push_str(member);
        }

        let decoder = self.decoder();
        let type_name = decoder.types().type_name(type_offset)?;
        let value = match expr.range {
            None => decoder.decode(type_offset, addr)?.to_string(),
            Some(range) => {
                let (_, kind) = decoder.types().underlying(type_offset)?;
                if kind != TypeKind::Str {
                    return Err(DwarfError::NotAString(base).into());
                }
                let (_, len) = decoder.string_header(addr)?;
                let (low, high) = range.resolve(len)?;
                decoder.read_string_range(addr, low, high)?
            }
        };

        Ok(Variable {
            name: expr.text,
            type_name,
            value,
        })
    }

    /// 現在のスコープのローカル変数（引数を除く）
    pub fn local_variables(&self) -> Result<Vec<Variable>> {
        self.scope_variables(gimli::DW_TAG_variable)
    }

    /// 現在の関数の引数
    pub fn function_arguments(&self) -> Result<Vec<Variable>> {
        self.scope_variables(gimli::DW_TAG_formal_parameter)
    }

    fn scope_variables(&self, tag: gimli::DwTag) -> Result<Vec<Variable>> {
        let scope = self
            .scope()?
            .ok_or(DwarfError::FunctionNotFound(self.frame.pc))?;
        let frame_base = self.frame_base(&scope.function)?;
        let decoder = self.decoder();

        let mut variables = Vec::new();
        for entry in scope.variables.iter().filter(|e| e.tag == tag) {
            let Some(name) = entry.name() else {
                continue;
            };
            let type_offset = type_of(entry)?;
            let addr = self.address_of(entry, frame_base)?;
            variables.push(Variable {
                name: name.to_string(),
                type_name: decoder.types().type_name(type_offset)?,
                value: decoder.decode(type_offset, addr)?.to_string(),
            });
        }

        Ok(variables)
    }

    /// 式の先頭を変数として解決する
    fn resolve(&self, expr: &Expression) -> Result<Option<Resolved>> {
        if let Some(scope) = self.scope()? {
            let found = scope
                .variables
                .iter()
                .find(|e| e.name() == Some(expr.path[0].as_str()));
            if let Some(entry) = found {
                return Ok(Some(Resolved {
                    entry: entry.clone(),
                    frame_base: self.frame_base(&scope.function)?,
                    consumed: 1,
                }));
            }
        }

        // パッケージ変数は `main.counter` のようにドットを含むので最長一致で探す
        let mut best: Option<(usize, DebugEntry)> = None;
        let mut cursor = self.info.cursor();
        while let Some(entry) = cursor.next_package_variable()? {
            let Some(name) = entry.name() else {
                continue;
            };
            let Some(consumed) = matched_segments(&expr.path, name) else {
                continue;
            };
            if best.as_ref().map_or(true, |(n, _)| consumed > *n) {
                let done = consumed == expr.path.len();
                best = Some((consumed, entry));
                if done {
                    break;
                }
            }
        }

        Ok(best.map(|(consumed, entry)| Resolved {
            entry,
            frame_base: None,
            consumed,
        }))
    }

    /// PCを含む関数と、そこから見える変数を集める
    fn scope(&self) -> Result<Option<Scope>> {
        let mut cursor = self.info.cursor();
        let function = match cursor.seek_to_function(self.frame.pc) {
            Ok(function) => function,
            Err(e) if matches!(e.downcast_ref::<DwarfError>(), Some(DwarfError::FunctionNotFound(_))) => {
                tracing::debug!(pc = self.frame.pc, "no enclosing function");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut variables = Vec::new();
        self.collect_scope(&function, &mut variables)?;
        Ok(Some(Scope {
            function,
            variables,
        }))
    }

    fn collect_scope(&self, scope: &DebugEntry, out: &mut Vec<DebugEntry>) -> Result<()> {
        let mut cursor = self.info.cursor();
        cursor.seek_to_entry(scope)?;

        let mut blocks = Vec::new();
        while let Some(entry) = cursor.next_sibling(|e| {
            e.tag == gimli::DW_TAG_variable
                || e.tag == gimli::DW_TAG_formal_parameter
                || e.tag == gimli::DW_TAG_lexical_block
        })? {
            if entry.tag == gimli::DW_TAG_lexical_block {
                if entry.contains_pc(self.frame.pc) {
                    blocks.push(entry);
                }
                continue;
            }
            if let Some(name) = entry.name() {
                out.retain(|v| v.name() != Some(name));
            }
            out.push(entry);
        }

        // 内側のブロックの宣言が外側を隠す
        for block in &blocks {
            self.collect_scope(block, out)?;
        }
        Ok(())
    }

    /// 関数のフレームベース（`DW_AT_frame_base` がなければCFA）
    fn frame_base(&self, function: &DebugEntry) -> Result<Option<u64>> {
        let Some(expr) = function.frame_base() else {
            return Ok(Some(self.frame.cfa));
        };

        let base = match self.evaluator(function).evaluate(expr, None)? {
            Loc::Addr { addr } => addr,
            Loc::Value { value } => value,
            Loc::Reg { reg } => self.frame.register(reg)?,
            Loc::Empty => return Ok(None),
        };
        Ok(Some(base))
    }

    fn evaluator(&self, entry: &DebugEntry) -> LocationEvaluator<'a> {
        let encoding = self
            .info
            .encoding(entry.unit)
            .unwrap_or_else(default_encoding);
        LocationEvaluator::new(self.frame, self.memory, encoding)
    }

    /// 変数のメモリアドレス
    fn address_of(&self, entry: &DebugEntry, frame_base: Option<u64>) -> Result<u64> {
        let name = entry.name().unwrap_or_default().to_string();
        let expr = entry
            .location()
            .ok_or_else(|| DwarfError::UnsupportedLocation(name.clone()))?;

        match self.evaluator(entry).evaluate(expr, frame_base)? {
            Loc::Addr { addr } => Ok(addr),
            other => {
                tracing::debug!(%name, ?other, "variable is not in memory");
                Err(DwarfError::UnsupportedLocation(name).into())
            }
        }
    }

    /// `base.member` のアドレスと型を求める
    ///
    /// メンバの存在を先に確認し、その後でnilポインタを検出します。
    fn member_access(
        &self,
        base: &str,
        type_offset: Offset,
        addr: u64,
        member: &str,
    ) -> Result<(Offset, u64)> {
        let types = self.types();
        let no_member = || DwarfError::NoSuchMember {
            base: base.to_string(),
            member: member.to_string(),
        };

        match types.underlying(type_offset)? {
            (struct_offset, TypeKind::Struct { .. }) => {
                let m = types.member(struct_offset, member)?.ok_or_else(no_member)?;
                Ok((m.type_offset, addr + m.offset))
            }
            (_, TypeKind::Pointer {
                pointee: Some(pointee),
            }) => {
                let (struct_offset, kind) = types.underlying(pointee)?;
                if !matches!(kind, TypeKind::Struct { .. }) {
                    return Err(DwarfError::NotAStruct(base.to_string()).into());
                }
                let m = types.member(struct_offset, member)?.ok_or_else(no_member)?;

                let ptr = self.memory.read_u64(addr)?;
                if ptr == 0 {
                    return Err(DwarfError::NilDereference(base.to_string()).into());
                }
                Ok((m.type_offset, ptr + m.offset))
            }
            _ => Err(DwarfError::NotAStruct(base.to_string()).into()),
        }
    }
}

fn type_of(entry: &DebugEntry) -> Result<Offset> {
    Ok(entry.type_offset().ok_or(DwarfError::MissingAttribute {
        offset: entry.offset,
        attr: "type",
    })?)
}

/// `name` がパスの先頭何セグメントに一致するか
fn matched_segments(path: &[String], name: &str) -> Option<usize> {
    let mut rest = name;
    for (i, segment) in path.iter().enumerate() {
        rest = rest.strip_prefix(segment.as_str())?;
        if rest.is_empty() {
            return Some(i + 1);
        }
        rest = rest.strip_prefix('.')?;
    }
    None
}
