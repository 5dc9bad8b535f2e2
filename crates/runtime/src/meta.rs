//! Metamethod events and fast-absence caching.
//!
//! Every event name is interned once at startup and pinned against
//! collection. The first few events are cached per-table: a bit set in
//! `Table::flags` means "this table, used as a metatable, has no such
//! field", letting hot paths skip the lookup entirely.

use crate::heap::{Heap, StrRef, TableRef};
use crate::table::Table;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tm {
    Index = 0,
    NewIndex = 1,
    Gc = 2,
    Mode = 3,
    Len = 4,
    Eq = 5, // last event with a fast-absence cache bit
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    ToString,
}

pub const TM_COUNT: usize = 25;
/// Events 0..=5 participate in the per-table absence cache.
pub const TM_CACHED: u8 = 6;

impl Tm {
    pub const ALL: [Tm; TM_COUNT] = [
        Tm::Index,
        Tm::NewIndex,
        Tm::Gc,
        Tm::Mode,
        Tm::Len,
        Tm::Eq,
        Tm::Add,
        Tm::Sub,
        Tm::Mul,
        Tm::Mod,
        Tm::Pow,
        Tm::Div,
        Tm::IDiv,
        Tm::BAnd,
        Tm::BOr,
        Tm::BXor,
        Tm::Shl,
        Tm::Shr,
        Tm::Unm,
        Tm::BNot,
        Tm::Lt,
        Tm::Le,
        Tm::Concat,
        Tm::Call,
        Tm::ToString,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tm::Index => "__index",
            Tm::NewIndex => "__newindex",
            Tm::Gc => "__gc",
            Tm::Mode => "__mode",
            Tm::Len => "__len",
            Tm::Eq => "__eq",
            Tm::Add => "__add",
            Tm::Sub => "__sub",
            Tm::Mul => "__mul",
            Tm::Mod => "__mod",
            Tm::Pow => "__pow",
            Tm::Div => "__div",
            Tm::IDiv => "__idiv",
            Tm::BAnd => "__band",
            Tm::BOr => "__bor",
            Tm::BXor => "__bxor",
            Tm::Shl => "__shl",
            Tm::Shr => "__shr",
            Tm::Unm => "__unm",
            Tm::BNot => "__bnot",
            Tm::Lt => "__lt",
            Tm::Le => "__le",
            Tm::Concat => "__concat",
            Tm::Call => "__call",
            Tm::ToString => "__tostring",
        }
    }

    /// The operator spelling for error messages on arithmetic events.
    pub fn operator(self) -> &'static str {
        match self {
            Tm::Add => "add",
            Tm::Sub => "sub",
            Tm::Mul => "mul",
            Tm::Mod => "mod",
            Tm::Pow => "pow",
            Tm::Div => "div",
            Tm::IDiv => "idiv",
            Tm::BAnd | Tm::BOr | Tm::BXor | Tm::Shl | Tm::Shr => "bitwise operation",
            Tm::Unm => "unm",
            Tm::BNot => "bnot",
            Tm::Concat => "concatenate",
            _ => self.name(),
        }
    }
}

/// Raw lookup of event `tm` in metatable `mt`, maintaining the absence
/// cache for the first events.
pub fn fast_tm(heap: &mut Heap, seed: u32, names: &[StrRef; TM_COUNT], mt: TableRef, tm: Tm) -> Value {
    let event = tm as u8;
    if event < TM_CACHED && heap.table(mt).flags & (1 << event) != 0 {
        return Value::Nil;
    }
    let v = heap.table(mt).get_str(heap, seed, names[tm as usize]);
    if v.is_nil() && event < TM_CACHED {
        heap.table_mut(mt).flags |= 1 << event;
    }
    v
}

/// Lookup without cache maintenance (read-only heap).
pub fn get_tm(heap: &Heap, seed: u32, names: &[StrRef; TM_COUNT], mt: &Table, tm: Tm) -> Value {
    mt.get_str(heap, seed, names[tm as usize])
}
