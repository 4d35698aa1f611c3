//! テスト用の合成デバッグ情報とメモリイメージ
//!
//! `fixtures/testvariables.go` をGoでビルドしたときのDWARFと、
//! `foobar` の `barfoo()` 呼び出し直前で停止したときのメモリを模しています。

#![allow(dead_code)]

use shiori_dwarf::{AttrValue, DebugInfo, DebugInfoBuilder, FrameContext, MemoryReader, Offset};
use std::collections::HashMap;

pub const BARFOO_LOW: u64 = 0x401000;
pub const BARFOO_HIGH: u64 = 0x401080;
pub const FOOBAR_LOW: u64 = 0x401100;
pub const FOOBAR_HIGH: u64 = 0x401400;
pub const BLOCK_LOW: u64 = 0x401300;
pub const BLOCK_HIGH: u64 = 0x401380;
pub const MAIN_LOW: u64 = 0x401400;
pub const MAIN_HIGH: u64 = 0x401480;

/// `foobar` の `barfoo()` 呼び出し位置
pub const FOOBAR_STOP_PC: u64 = 0x401200;
/// `foobar` 内のブロックの中
pub const BLOCK_STOP_PC: u64 = 0x401310;
/// `barfoo` の `fmt.Println(a1)` 位置
pub const BARFOO_STOP_PC: u64 = 0x401040;

pub const FOOBAR_CFA: u64 = 0x7ff0_0000_1000;
pub const BARFOO_CFA: u64 = 0x7ff0_0000_0800;

pub const COUNTER_ADDR: u64 = 0x5a_0000;
pub const POINT_ADDR: u64 = 0x5a_0010;

const HEAP: u64 = 0xc000_0100_00;

/// 疎なバイト列で表したメモリ
pub struct FakeMemory {
    bytes: HashMap<u64, u8>,
    next_heap: u64,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            bytes: HashMap::new(),
            next_heap: HEAP,
        }
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_i64(&mut self, addr: u64, value: i64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// ヒープ領域に書き込み、そのアドレスを返す
    pub fn alloc(&mut self, data: &[u8]) -> u64 {
        let addr = self.next_heap;
        self.write(addr, data);
        self.next_heap += (data.len() as u64 + 15).max(16) & !15;
        addr
    }

    /// 文字列ヘッダを書き、データのアドレスを返す
    pub fn write_string(&mut self, addr: u64, s: &str) -> u64 {
        let ptr = self.alloc(s.as_bytes());
        self.write_u64(addr, ptr);
        self.write_u64(addr + 8, s.len() as u64);
        ptr
    }

    /// `FooBar{Baz, Bur}` / `FooBar2{Bur, Baz}` 共通のレイアウト（int, string）
    pub fn write_int_string(&mut self, addr: u64, n: i64, s: &str) {
        self.write_i64(addr, n);
        self.write_string(addr + 8, s);
    }
}

impl MemoryReader for FakeMemory {
    fn read(&self, addr: u64, size: usize) -> anyhow::Result<Vec<u8>> {
        (0..size as u64)
            .map(|i| {
                self.bytes
                    .get(&(addr + i))
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("unmapped address 0x{:x}", addr + i))
            })
            .collect()
    }
}

fn sleb128(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            return out;
        }
    }
}

fn name(n: &str) -> (gimli::DwAt, AttrValue) {
    (gimli::DW_AT_name, AttrValue::Str(n.to_string()))
}

fn ty(offset: Offset) -> (gimli::DwAt, AttrValue) {
    (gimli::DW_AT_type, AttrValue::Ref(offset))
}

fn size(n: u64) -> (gimli::DwAt, AttrValue) {
    (gimli::DW_AT_byte_size, AttrValue::Udata(n))
}

/// DW_OP_call_frame_cfa; DW_OP_consts off; DW_OP_plus
fn cfa_loc(off: i64) -> (gimli::DwAt, AttrValue) {
    let mut expr = vec![0x9c, 0x11];
    expr.extend(sleb128(off));
    expr.push(0x22);
    (gimli::DW_AT_location, AttrValue::Expr(expr))
}

/// DW_OP_fbreg off
fn fbreg_loc(off: i64) -> (gimli::DwAt, AttrValue) {
    let mut expr = vec![0x91];
    expr.extend(sleb128(off));
    (gimli::DW_AT_location, AttrValue::Expr(expr))
}

/// DW_OP_addr addr
fn addr_loc(addr: u64) -> (gimli::DwAt, AttrValue) {
    let mut expr = vec![0x03];
    expr.extend(addr.to_le_bytes());
    (gimli::DW_AT_location, AttrValue::Expr(expr))
}

fn external() -> (gimli::DwAt, AttrValue) {
    (gimli::DW_AT_external, AttrValue::Flag(true))
}

fn pc_range(low: u64, high: u64) -> Vec<(gimli::DwAt, AttrValue)> {
    vec![
        (gimli::DW_AT_low_pc, AttrValue::Addr(low)),
        (gimli::DW_AT_high_pc, AttrValue::Addr(high)),
    ]
}

fn base(b: &mut DebugInfoBuilder, n: &str, encoding: gimli::DwAte, bytes: u64) -> Offset {
    b.entry(
        gimli::DW_TAG_base_type,
        vec![name(n), (gimli::DW_AT_encoding, AttrValue::Encoding(encoding)), size(bytes)],
        false,
    )
}

fn member(b: &mut DebugInfoBuilder, n: &str, t: Offset, offset: u64) {
    b.entry(
        gimli::DW_TAG_member,
        vec![
            name(n),
            ty(t),
            (gimli::DW_AT_data_member_location, AttrValue::Udata(offset)),
        ],
        false,
    );
}

fn array(b: &mut DebugInfoBuilder, elem: Offset, count: u64) -> Offset {
    let offset = b.entry(gimli::DW_TAG_array_type, vec![ty(elem)], true);
    b.entry(
        gimli::DW_TAG_subrange_type,
        vec![(gimli::DW_AT_count, AttrValue::Udata(count))],
        false,
    );
    b.end_children();
    offset
}

fn variable(b: &mut DebugInfoBuilder, n: &str, t: Offset, off: i64) {
    b.entry(gimli::DW_TAG_variable, vec![name(n), ty(t), cfa_loc(off)], false);
}

fn parameter(b: &mut DebugInfoBuilder, n: &str, t: Offset, off: i64) {
    b.entry(gimli::DW_TAG_formal_parameter, vec![name(n), ty(t), fbreg_loc(off)], false);
}

/// `testvariables` の合成デバッグ情報
pub fn debug_info() -> DebugInfo {
    let mut b = DebugInfoBuilder::new();
    b.entry(gimli::DW_TAG_compile_unit, vec![name("main")], true);

    let int = base(&mut b, "int", gimli::DW_ATE_signed, 8);
    let int8 = base(&mut b, "int8", gimli::DW_ATE_signed, 1);
    let int32 = base(&mut b, "int32", gimli::DW_ATE_signed, 4);
    let uint8 = base(&mut b, "uint8", gimli::DW_ATE_unsigned, 1);
    let float32 = base(&mut b, "float32", gimli::DW_ATE_float, 4);
    let float64 = base(&mut b, "float64", gimli::DW_ATE_float, 8);

    let uint8_ptr = b.entry(gimli::DW_TAG_pointer_type, vec![name("*uint8"), ty(uint8)], false);
    let int_ptr = b.entry(gimli::DW_TAG_pointer_type, vec![name("*int"), ty(int)], false);

    let string = b.entry(gimli::DW_TAG_structure_type, vec![name("string"), size(16)], true);
    member(&mut b, "str", uint8_ptr, 0);
    member(&mut b, "len", int, 8);
    b.end_children();

    let int_slice = b.entry(gimli::DW_TAG_structure_type, vec![name("[]int"), size(24)], true);
    member(&mut b, "array", int_ptr, 0);
    member(&mut b, "len", int, 8);
    member(&mut b, "cap", int, 16);
    b.end_children();

    let int_array = array(&mut b, int, 2);
    let int32_array = array(&mut b, int32, 2);

    let foo_bar_struct =
        b.entry(gimli::DW_TAG_structure_type, vec![name("main.FooBar"), size(24)], true);
    member(&mut b, "Baz", int, 0);
    member(&mut b, "Bur", string, 8);
    b.end_children();
    let foo_bar = b.entry(gimli::DW_TAG_typedef, vec![name("main.FooBar"), ty(foo_bar_struct)], false);

    let foo_bar2_struct =
        b.entry(gimli::DW_TAG_structure_type, vec![name("main.FooBar2"), size(24)], true);
    member(&mut b, "Bur", int, 0);
    member(&mut b, "Baz", string, 8);
    b.end_children();
    let foo_bar2 =
        b.entry(gimli::DW_TAG_typedef, vec![name("main.FooBar2"), ty(foo_bar2_struct)], false);

    let foo_bar_ptr =
        b.entry(gimli::DW_TAG_pointer_type, vec![name("*main.FooBar"), ty(foo_bar)], false);

    let frame_base = (gimli::DW_AT_frame_base, AttrValue::Expr(vec![0x9c]));

    // func barfoo()
    let mut attrs = vec![name("main.barfoo"), frame_base.clone(), external()];
    attrs.extend(pc_range(BARFOO_LOW, BARFOO_HIGH));
    b.entry(gimli::DW_TAG_subprogram, attrs, true);
    variable(&mut b, "a1", string, -16);
    b.end_children();

    // func foobar(baz string, bar FooBar)
    let mut attrs = vec![name("main.foobar"), frame_base.clone(), external()];
    attrs.extend(pc_range(FOOBAR_LOW, FOOBAR_HIGH));
    b.entry(gimli::DW_TAG_subprogram, attrs, true);
    parameter(&mut b, "baz", string, 0);
    parameter(&mut b, "bar", foo_bar, 16);
    variable(&mut b, "a1", string, -16);
    variable(&mut b, "a2", int, -24);
    variable(&mut b, "a3", float64, -32);
    variable(&mut b, "a4", int_array, -48);
    variable(&mut b, "a5", int_slice, -72);
    variable(&mut b, "a6", foo_bar, -96);
    variable(&mut b, "a7", foo_bar_ptr, -104);
    variable(&mut b, "a8", foo_bar2, -128);
    variable(&mut b, "a9", foo_bar_ptr, -136);
    variable(&mut b, "a10", string, -152);
    variable(&mut b, "neg", int, -160);
    variable(&mut b, "i8", int8, -161);
    variable(&mut b, "f32", float32, -168);
    variable(&mut b, "i32", int32_array, -176);
    b.entry(gimli::DW_TAG_lexical_block, pc_range(BLOCK_LOW, BLOCK_HIGH), true);
    variable(&mut b, "inner", int, -184);
    variable(&mut b, "a2", int, -192);
    b.end_children();
    b.end_children();

    // func main()
    let mut attrs = vec![name("main.main"), frame_base, external()];
    attrs.extend(pc_range(MAIN_LOW, MAIN_HIGH));
    b.entry(gimli::DW_TAG_subprogram, attrs, false);

    // パッケージ変数
    b.entry(
        gimli::DW_TAG_variable,
        vec![name("main.counter"), ty(int), addr_loc(COUNTER_ADDR), external()],
        false,
    );
    b.entry(
        gimli::DW_TAG_variable,
        vec![name("main.point"), ty(foo_bar), addr_loc(POINT_ADDR), external()],
        false,
    );

    b.end_children();
    b.build()
}

/// 停止時のメモリイメージ
pub fn memory() -> FakeMemory {
    let mut m = FakeMemory::new();

    // foobar の引数
    let cfa = FOOBAR_CFA;
    m.write_string(cfa, "bazburzum");
    m.write_int_string(cfa + 16, 10, "lorem");

    // foobar のローカル変数
    let a1 = cfa - 16;
    let a1_data = m.write_string(a1, "foofoofoofoofoofoo");
    m.write_i64(cfa - 24, 6);
    m.write(cfa - 32, &7.23f64.to_le_bytes());
    m.write_i64(cfa - 48, 1);
    m.write_i64(cfa - 40, 2);

    let elems: Vec<u8> = (1..=5i64).flat_map(|i| i.to_le_bytes()).collect();
    let backing = m.alloc(&elems);
    m.write_u64(cfa - 72, backing);
    m.write_u64(cfa - 64, 5);
    m.write_u64(cfa - 56, 5);

    m.write_int_string(cfa - 96, 8, "word");

    let a7_target = m.alloc(&[0; 24]);
    m.write_int_string(a7_target, 5, "strum");
    m.write_u64(cfa - 104, a7_target);

    m.write_int_string(cfa - 128, 10, "feh");
    m.write_u64(cfa - 136, 0);

    // a10 = a1[2:5] は a1 と同じデータを共有する
    m.write_u64(cfa - 152, a1_data + 2);
    m.write_u64(cfa - 144, 3);

    m.write_i64(cfa - 160, -1);
    m.write(cfa - 161, &[1]);
    m.write(cfa - 168, &1.2f32.to_le_bytes());
    m.write(cfa - 176, &1i32.to_le_bytes());
    m.write(cfa - 172, &2i32.to_le_bytes());

    // ブロック内の変数
    m.write_i64(cfa - 184, 99);
    m.write_i64(cfa - 192, 60);

    // barfoo のローカル変数
    m.write_string(BARFOO_CFA - 16, "bur");

    // パッケージ変数
    m.write_i64(COUNTER_ADDR, 42);
    m.write_int_string(POINT_ADDR, 3, "pt");

    m
}

fn frame(pc: u64, cfa: u64) -> FrameContext {
    FrameContext {
        pc,
        cfa,
        load_bias: 0,
        registers: HashMap::from([(7, cfa - 0x200), (6, cfa - 16)]),
    }
}

/// `foobar` の `barfoo()` 呼び出しで停止したフレーム
pub fn foobar_frame() -> FrameContext {
    frame(FOOBAR_STOP_PC, FOOBAR_CFA)
}

/// `foobar` のブロック内で停止したフレーム
pub fn block_frame() -> FrameContext {
    frame(BLOCK_STOP_PC, FOOBAR_CFA)
}

/// `barfoo` で停止したフレーム
pub fn barfoo_frame() -> FrameContext {
    frame(BARFOO_STOP_PC, BARFOO_CFA)
}
