//! The garbage-collected heap: a slot vector with generational handles.
//!
//! Every collectable object lives in one slot. A `GcRef` is the slot
//! index plus the slot's generation; freeing a slot bumps the
//! generation, so stale handles can never alias a new object. Typed
//! wrapper handles (`StrRef`, `TableRef`, ...) keep the object kind in
//! the type system.
//!
//! The allocator accounts every byte into the GC debt counter; the
//! collector never sees an object it did not account for.

use crate::func::{LClosure, NClosure, Proto, Userdata};
use crate::lstr::LStr;
use crate::state::Thread;
use crate::table::Table;

/// Generational heap reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub(crate) idx: u32,
    pub(crate) r#gen: u32,
}

macro_rules! typed_ref {
    ($($name:ident),*) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub(crate) GcRef);

            impl $name {
                pub fn raw(self) -> GcRef {
                    self.0
                }
            }
        )*
    };
}

typed_ref!(StrRef, TableRef, ClosureRef, NativeClosRef, UdRef, ProtoRef, ThreadRef);

// GC color/state bits in the object header.
pub const WHITE0: u8 = 1 << 0;
pub const WHITE1: u8 = 1 << 1;
pub const BLACK: u8 = 1 << 2;
pub const FINALIZED: u8 = 1 << 3;
/// Never collected (metamethod name strings).
pub const FIXED: u8 = 1 << 4;
pub const WHITE_BITS: u8 = WHITE0 | WHITE1;

/// Common header of every collectable object.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub marked: u8,
    /// Intrusive link threading this object into allgc / finobj /
    /// tobefnz.
    pub next: Option<GcRef>,
}

impl GcHeader {
    pub fn is_white(&self) -> bool {
        self.marked & WHITE_BITS != 0
    }

    pub fn is_black(&self) -> bool {
        self.marked & BLACK != 0
    }

    pub fn is_gray(&self) -> bool {
        self.marked & (WHITE_BITS | BLACK) == 0
    }

    /// White of the non-current cycle: condemned.
    pub fn is_dead(&self, other_white: u8) -> bool {
        self.marked & other_white != 0
    }

    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !(WHITE_BITS | BLACK)) | current_white;
    }

    pub fn make_gray(&mut self) {
        self.marked &= !(WHITE_BITS | BLACK);
    }

    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITE_BITS) | BLACK;
    }
}

#[derive(Debug)]
pub enum ObjData {
    Str(LStr),
    Table(Table),
    Closure(LClosure),
    NativeClosure(NClosure),
    Userdata(Userdata),
    Proto(Proto),
    Thread(Box<Thread>),
}

#[derive(Debug)]
pub struct GcObject {
    pub header: GcHeader,
    pub data: ObjData,
}

impl GcObject {
    /// Rough byte footprint, for GC debt and work accounting.
    pub fn size(&self) -> usize {
        let payload = match &self.data {
            ObjData::Str(s) => s.bytes.len(),
            ObjData::Table(t) => {
                t.array.len() * std::mem::size_of::<crate::value::Value>()
                    + t.nodes.len() * std::mem::size_of::<crate::table::Node>()
            }
            ObjData::Closure(c) => c.upvals.len() * 16,
            ObjData::NativeClosure(c) => {
                c.upvals.len() * std::mem::size_of::<crate::value::Value>()
            }
            ObjData::Userdata(u) => u.data.len(),
            ObjData::Proto(p) => {
                p.code.len() * 4
                    + p.constants.len() * std::mem::size_of::<crate::value::Value>()
                    + p.line_info.len() * 4
            }
            ObjData::Thread(th) => th.stack.len() * std::mem::size_of::<crate::value::Value>(),
        };
        payload + 64
    }
}

struct Slot {
    r#gen: u32,
    obj: Option<GcObject>,
}

/// The object heap. Allocation feeds the GC debt; the collector calls
/// back into `free` during sweep.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live bytes as accounted at allocation/free time.
    pub total_bytes: usize,
    /// Allocation debt driving GC steps; positive means a step is due.
    pub debt: isize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap { slots: Vec::new(), free: Vec::new(), total_bytes: 0, debt: 0 }
    }

    /// Insert an object, accounting its size. The caller links it into
    /// the proper GC list.
    pub fn insert(&mut self, obj: GcObject) -> GcRef {
        let size = obj.size();
        self.total_bytes += size;
        self.debt += size as isize;
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                debug_assert!(slot.obj.is_none());
                slot.obj = Some(obj);
                GcRef { idx, r#gen: slot.r#gen }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot { r#gen: 0, obj: Some(obj) });
                GcRef { idx, r#gen: 0 }
            }
        }
    }

    /// Drop the object in `r`, returning it for any final bookkeeping.
    pub fn free(&mut self, r: GcRef) -> GcObject {
        let slot = &mut self.slots[r.idx as usize];
        debug_assert_eq!(slot.r#gen, r.r#gen, "stale reference freed");
        let obj = slot.obj.take().expect("double free");
        slot.r#gen = slot.r#gen.wrapping_add(1);
        self.free.push(r.idx);
        let size = obj.size();
        self.total_bytes = self.total_bytes.saturating_sub(size);
        self.debt -= size as isize;
        obj
    }

    /// Re-account an object whose payload grew or shrank by `delta`
    /// bytes (table resize, stack growth).
    pub fn account(&mut self, delta: isize) {
        if delta >= 0 {
            self.total_bytes += delta as usize;
        } else {
            self.total_bytes = self.total_bytes.saturating_sub((-delta) as usize);
        }
        self.debt += delta;
    }

    pub fn contains(&self, r: GcRef) -> bool {
        self.slots
            .get(r.idx as usize)
            .is_some_and(|s| s.r#gen == r.r#gen && s.obj.is_some())
    }

    pub fn get(&self, r: GcRef) -> &GcObject {
        let slot = &self.slots[r.idx as usize];
        debug_assert_eq!(slot.r#gen, r.r#gen, "stale reference");
        slot.obj.as_ref().expect("freed object")
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut GcObject {
        let slot = &mut self.slots[r.idx as usize];
        debug_assert_eq!(slot.r#gen, r.r#gen, "stale reference");
        slot.obj.as_mut().expect("freed object")
    }

    pub fn header(&self, r: GcRef) -> &GcHeader {
        &self.get(r).header
    }

    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        &mut self.get_mut(r).header
    }

    // Typed accessors. A mismatch means a corrupted value (invariant
    // V1), which is a hard bug, hence the panics.

    pub fn str(&self, r: StrRef) -> &LStr {
        match &self.get(r.0).data {
            ObjData::Str(s) => s,
            _ => unreachable!("string handle to non-string"),
        }
    }

    pub fn str_mut(&mut self, r: StrRef) -> &mut LStr {
        match &mut self.get_mut(r.0).data {
            ObjData::Str(s) => s,
            _ => unreachable!("string handle to non-string"),
        }
    }

    pub fn table(&self, r: TableRef) -> &Table {
        match &self.get(r.0).data {
            ObjData::Table(t) => t,
            _ => unreachable!("table handle to non-table"),
        }
    }

    pub fn table_mut(&mut self, r: TableRef) -> &mut Table {
        match &mut self.get_mut(r.0).data {
            ObjData::Table(t) => t,
            _ => unreachable!("table handle to non-table"),
        }
    }

    /// Temporarily move a table out of its slot so it can be mutated
    /// with the rest of the heap readable. Pair with `put_table`.
    pub fn take_table(&mut self, r: TableRef) -> Table {
        match &mut self.get_mut(r.0).data {
            ObjData::Table(t) => std::mem::take(t),
            _ => unreachable!("table handle to non-table"),
        }
    }

    pub fn put_table(&mut self, r: TableRef, t: Table) {
        match &mut self.get_mut(r.0).data {
            ObjData::Table(slot) => *slot = t,
            _ => unreachable!("table handle to non-table"),
        }
    }

    pub fn closure(&self, r: ClosureRef) -> &LClosure {
        match &self.get(r.0).data {
            ObjData::Closure(c) => c,
            _ => unreachable!("closure handle to non-closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ClosureRef) -> &mut LClosure {
        match &mut self.get_mut(r.0).data {
            ObjData::Closure(c) => c,
            _ => unreachable!("closure handle to non-closure"),
        }
    }

    pub fn native_closure(&self, r: NativeClosRef) -> &NClosure {
        match &self.get(r.0).data {
            ObjData::NativeClosure(c) => c,
            _ => unreachable!("native-closure handle mismatch"),
        }
    }

    pub fn native_closure_mut(&mut self, r: NativeClosRef) -> &mut NClosure {
        match &mut self.get_mut(r.0).data {
            ObjData::NativeClosure(c) => c,
            _ => unreachable!("native-closure handle mismatch"),
        }
    }

    pub fn userdata(&self, r: UdRef) -> &Userdata {
        match &self.get(r.0).data {
            ObjData::Userdata(u) => u,
            _ => unreachable!("userdata handle mismatch"),
        }
    }

    pub fn userdata_mut(&mut self, r: UdRef) -> &mut Userdata {
        match &mut self.get_mut(r.0).data {
            ObjData::Userdata(u) => u,
            _ => unreachable!("userdata handle mismatch"),
        }
    }

    pub fn proto(&self, r: ProtoRef) -> &Proto {
        match &self.get(r.0).data {
            ObjData::Proto(p) => p,
            _ => unreachable!("proto handle mismatch"),
        }
    }

    pub fn thread(&self, r: ThreadRef) -> &Thread {
        match &self.get(r.0).data {
            ObjData::Thread(t) => t,
            _ => unreachable!("thread handle mismatch"),
        }
    }

    pub fn thread_mut(&mut self, r: ThreadRef) -> &mut Thread {
        match &mut self.get_mut(r.0).data {
            ObjData::Thread(t) => t,
            _ => unreachable!("thread handle mismatch"),
        }
    }

    pub fn take_thread(&mut self, r: ThreadRef) -> Box<Thread> {
        match &mut self.get_mut(r.0).data {
            ObjData::Thread(t) => std::mem::replace(t, Box::default()),
            _ => unreachable!("thread handle mismatch"),
        }
    }

    pub fn put_thread(&mut self, r: ThreadRef, t: Box<Thread>) {
        match &mut self.get_mut(r.0).data {
            ObjData::Thread(slot) => *slot = t,
            _ => unreachable!("thread handle mismatch"),
        }
    }

    /// Number of live objects (diagnostics and tests).
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}
