//! Function prototypes, closures, upvalue cells, and userdata.
//!
//! A runtime `Proto` is the heap-resident form of a compiled function:
//! constants are live values (strings interned), nested protos are heap
//! references. It is immutable after loading.
//!
//! Upvalue cells are refcounted handles distinct from the GC heap. An
//! *open* cell aliases a live stack slot of its owning thread; closing
//! it copies the value into the cell. Every closure that captured the
//! same local shares one cell, so mutation through one closure is seen
//! by all.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use selune_core::opcode::Instruction;
use selune_core::proto::UpvalDesc;

use crate::heap::{Heap, ProtoRef, StrRef, TableRef, ThreadRef};
use crate::value::{NativeFn, Value};

/// Debug record of a local variable, names interned.
#[derive(Debug, Clone, Copy)]
pub struct LocVarRt {
    pub name: Option<StrRef>,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A loaded function prototype.
#[derive(Debug)]
pub struct Proto {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub upvalues: Vec<UpvalDesc>,
    pub protos: Vec<ProtoRef>,
    pub line_info: Vec<u32>,
    pub loc_vars: Vec<LocVarRt>,
    pub upvalue_names: Vec<Option<StrRef>>,
    pub source: Option<StrRef>,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl Proto {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// Debug name of the local at slot `n` (1-based) live at `pc`.
    pub fn local_name(&self, mut n: u32, pc: u32) -> Option<StrRef> {
        for lv in &self.loc_vars {
            if lv.start_pc > pc {
                break;
            }
            if pc < lv.end_pc {
                n -= 1;
                if n == 0 {
                    return lv.name;
                }
            }
        }
        None
    }
}

/// Where an upvalue cell's value lives.
#[derive(Debug)]
pub enum UpvalState {
    /// Aliases `thread`'s stack at `slot`.
    Open { thread: ThreadRef, slot: usize },
    Closed(Value),
}

/// A shared upvalue cell.
#[derive(Debug)]
pub struct UpvalCell {
    pub state: RefCell<UpvalState>,
    /// Set while the GC defers marking an open upvalue to the atomic
    /// remark of its thread.
    pub touched: Cell<bool>,
}

pub type UpvalRef = Rc<UpvalCell>;

pub fn new_open_upval(thread: ThreadRef, slot: usize) -> UpvalRef {
    Rc::new(UpvalCell {
        state: RefCell::new(UpvalState::Open { thread, slot }),
        touched: Cell::new(false),
    })
}

pub fn new_closed_upval(v: Value) -> UpvalRef {
    Rc::new(UpvalCell { state: RefCell::new(UpvalState::Closed(v)), touched: Cell::new(false) })
}

pub fn upval_is_open(uv: &UpvalRef) -> bool {
    matches!(&*uv.state.borrow(), UpvalState::Open { .. })
}

/// Read through a cell, chasing open cells into their thread's stack.
pub fn upval_get(heap: &Heap, uv: &UpvalRef) -> Value {
    match &*uv.state.borrow() {
        UpvalState::Open { thread, slot } => heap.thread(*thread).stack[*slot],
        UpvalState::Closed(v) => *v,
    }
}

/// Write through a cell.
pub fn upval_set(heap: &mut Heap, uv: &UpvalRef, v: Value) {
    let target = match &*uv.state.borrow() {
        UpvalState::Open { thread, slot } => Some((*thread, *slot)),
        UpvalState::Closed(_) => None,
    };
    match target {
        Some((thread, slot)) => heap.thread_mut(thread).stack[slot] = v,
        None => *uv.state.borrow_mut() = UpvalState::Closed(v),
    }
}

/// A script closure: prototype plus captured cells.
#[derive(Debug)]
pub struct LClosure {
    pub proto: ProtoRef,
    pub upvals: Vec<UpvalRef>,
}

/// A host closure: function pointer plus boxed upvalues.
#[derive(Debug)]
pub struct NClosure {
    pub f: NativeFn,
    pub upvals: Vec<Value>,
}

/// Full userdata: a raw byte block with an optional metatable and one
/// associated value.
#[derive(Debug)]
pub struct Userdata {
    pub data: Vec<u8>,
    pub metatable: Option<TableRef>,
    pub user_value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_upvalue_round_trip() {
        let mut heap = Heap::new();
        let uv = new_closed_upval(Value::Int(42));
        assert!(!upval_is_open(&uv));
        assert!(matches!(upval_get(&heap, &uv), Value::Int(42)));
        upval_set(&mut heap, &uv, Value::Int(7));
        assert!(matches!(upval_get(&heap, &uv), Value::Int(7)));
    }

    #[test]
    fn cells_are_shared() {
        let mut heap = Heap::new();
        let a = new_closed_upval(Value::Int(1));
        let b = Rc::clone(&a);
        upval_set(&mut heap, &b, Value::Int(2));
        assert!(matches!(upval_get(&heap, &a), Value::Int(2)));
        assert!(Rc::ptr_eq(&a, &b));
    }
}
