//! Global runtime state, threads, and call frames.
//!
//! One `Runtime` is one independent interpreter instance: the heap, the
//! string interner, the GC, the registry, per-type metatables, and the
//! main thread all live here. Threads (coroutines) are heap objects;
//! `current` names the one whose stack the API and the VM operate on.
//!
//! Because every reference into an operand stack is an index, growing a
//! stack never invalidates anything: frames, open upvalue cells, and
//! API slots all survive reallocation untouched.

use bitflags::bitflags;
use rand::RngCore;

use selune_core::limits::{
    ERROR_STACK_EXTRA, EXTRA_STACK, MAX_NATIVE_CALLS, MAX_STACK, MIN_STACK,
};

use crate::error::{Control, RtResult, Status};
use crate::func::{LClosure, NClosure, Proto, Userdata, UpvalRef};
use crate::gc::{self, GcState};
use crate::heap::{
    ClosureRef, GcHeader, GcObject, GcRef, Heap, NativeClosRef, ObjData, ProtoRef, StrRef,
    TableRef, ThreadRef, UdRef,
};
use crate::lstr::{self, StringTable};
use crate::meta::{TM_COUNT, Tm};
use crate::table::Table;
use crate::value::{NativeFn, NativeK, Type, Value};

bitflags! {
    /// Per-frame status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u8 {
        /// The frame entered the dispatch loop from native code; a
        /// RETURN here leaves the loop.
        const FRESH = 1 << 0;
        /// Yieldable protected call; resume may need to recover here.
        const YPCALL = 1 << 1;
        /// Frame was reused by a tail call.
        const TAIL = 1 << 2;
        /// `__le` is being simulated with an inverted `__lt`.
        const LEQ = 1 << 3;
        /// Frame is running a finalizer.
        const FIN = 1 << 4;
        /// Saved allow-hook bit for protected-call restore.
        const OAH = 1 << 5;
        /// A hook yielded at this instruction.
        const HOOKYIELD = 1 << 6;
    }
}

/// Payload distinguishing script frames from native frames.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// The sentinel frame at the bottom of every thread.
    Base,
    Lua {
        /// First register of the frame.
        base: usize,
        /// Index of the next instruction to execute.
        pc: usize,
    },
    Native {
        /// Continuation to call when resuming past this frame.
        k: Option<NativeK>,
        ctx: i64,
        /// `errfunc` active before a protected call through here.
        old_errfunc: usize,
    },
}

#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Stack index of the callee.
    pub func: usize,
    /// Stack ceiling this frame may use.
    pub top: usize,
    pub nresults: i32,
    pub flags: CallFlags,
    /// Saved stack position for yieldable protected calls: where the
    /// protected function sat, so recovery can unwind to it.
    pub extra: usize,
    pub kind: FrameKind,
}

impl CallInfo {
    pub fn is_lua(&self) -> bool {
        matches!(self.kind, FrameKind::Lua { .. })
    }
}

// Debug-hook event masks.
pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RET: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    TailCall,
    Return,
    Line,
    Count,
}

/// Host-installed debug hook.
pub type HookFn = fn(&mut Runtime, HookEvent, u32) -> RtResult<()>;

/// One coroutine: operand stack, frame list, open upvalues, status.
#[derive(Debug)]
pub struct Thread {
    /// The operand stack. Length is the allocated capacity; slots at
    /// or beyond `top` hold nil.
    pub stack: Vec<Value>,
    pub top: usize,
    /// Call frames, innermost last. Index 0 is the base sentinel.
    pub ci: Vec<CallInfo>,
    /// Open upvalue cells, sorted by descending stack slot.
    pub open_upvals: Vec<(usize, UpvalRef)>,
    pub status: Status,
    /// Non-yieldable native call depth; yields are legal only at 0.
    pub nny: u32,
    /// Reentrant native call depth (Rust stack usage bound).
    pub n_ccalls: u32,
    /// Stack index of the active error handler; 0 means none.
    pub errfunc: usize,
    /// How many values the last yield left on top, for the resumer.
    pub n_yielded: usize,
    pub hook: Option<HookFn>,
    pub hook_mask: u8,
    pub base_hook_count: u32,
    pub hook_count: u32,
    pub allow_hook: bool,
    /// Set while the error handler itself runs.
    pub in_errfunc: bool,
}

impl Default for Thread {
    fn default() -> Thread {
        Thread {
            stack: Vec::new(),
            top: 0,
            ci: Vec::new(),
            open_upvals: Vec::new(),
            status: Status::Ok,
            nny: 1,
            n_ccalls: 0,
            errfunc: 0,
            n_yielded: 0,
            hook: None,
            hook_mask: 0,
            base_hook_count: 0,
            hook_count: 0,
            allow_hook: true,
            in_errfunc: false,
        }
    }
}

impl Thread {
    /// Fresh thread with an initialized stack and base frame.
    pub fn fresh() -> Thread {
        let mut th = Thread::default();
        th.stack = vec![Value::Nil; 2 * MIN_STACK];
        th.top = 1; // slot 0 is the base frame's function position
        th.ci.push(CallInfo {
            func: 0,
            top: 1 + MIN_STACK,
            nresults: 0,
            flags: CallFlags::empty(),
            extra: 0,
            kind: FrameKind::Base,
        });
        th
    }

    pub fn frame(&self) -> &CallInfo {
        self.ci.last().expect("base frame always present")
    }

    pub fn frame_mut(&mut self) -> &mut CallInfo {
        self.ci.last_mut().expect("base frame always present")
    }

    /// Usable capacity boundary (keeps the metamethod scratch area).
    pub fn stack_last(&self) -> usize {
        self.stack.len().saturating_sub(EXTRA_STACK)
    }
}

/// Registry index of the main thread.
pub const RIDX_MAIN_THREAD: i64 = 1;
/// Registry index of the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Panic handler invoked for errors escaping all protection.
pub type PanicFn = fn(&mut Runtime) -> i32;

fn default_panic(rt: &mut Runtime) -> i32 {
    let msg = rt
        .describe_value(rt.top_value())
        .unwrap_or_else(|| "(error object is not a string)".into());
    tracing::error!(target: "selune::panic", error = %msg, "unprotected error");
    eprintln!("PANIC: unprotected error in call to Selune API ({msg})");
    std::process::abort();
}

/// One interpreter instance. Not `Send`/`Sync`: hosts wanting
/// parallelism create independent runtimes.
pub struct Runtime {
    pub heap: Heap,
    pub strings: StringTable,
    pub gc: GcState,
    pub registry: TableRef,
    pub globals: TableRef,
    pub main_thread: ThreadRef,
    /// The thread the API and VM currently operate on.
    pub current: ThreadRef,
    /// Fallback metatables per basic type (strings and others without
    /// their own slot).
    pub metatables: [Option<TableRef>; crate::value::NUM_TYPES],
    /// Interned, pinned metamethod names.
    pub tm_names: [StrRef; TM_COUNT],
    /// Preallocated out-of-memory error message.
    pub memerr: StrRef,
    /// Preallocated error-in-error-handling message.
    pub errerr: StrRef,
    /// Threads that own open upvalues, for the GC's atomic remark.
    pub twups: Vec<ThreadRef>,
    pub panic: PanicFn,
    // Not Send/Sync: one runtime is one logical thread of execution.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Runtime {
    pub fn new() -> Box<Runtime> {
        let mut heap = Heap::new();
        let mut gcstate = GcState::new();
        let seed = rand::thread_rng().next_u32();
        let mut strings = StringTable::new(seed);
        let white = gcstate.current_white;

        // Objects created before the runtime exists are linked into
        // allgc by hand.
        let mut allgc: Option<GcRef> = None;
        let mut link = |heap: &mut Heap, r: GcRef| {
            heap.header_mut(r).next = allgc;
            allgc = Some(r);
        };

        let main = Thread::fresh();
        let main_ref = ThreadRef(heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Thread(Box::new(main)),
        }));
        link(&mut heap, main_ref.0);

        let registry = TableRef(heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Table(Table::with_capacity(2, 0)),
        }));
        link(&mut heap, registry.0);
        let globals = TableRef(heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Table(Table::new()),
        }));
        link(&mut heap, globals.0);
        {
            let mut t = heap.take_table(registry);
            t.set_int(&mut heap, seed, RIDX_MAIN_THREAD, Value::Thread(main_ref));
            t.set_int(&mut heap, seed, RIDX_GLOBALS, Value::Table(globals));
            heap.put_table(registry, t);
        }

        let mut tm_names = Vec::with_capacity(TM_COUNT);
        for tm in Tm::ALL {
            let (s, fresh) = strings.new_string(&mut heap, tm.name().as_bytes(), white);
            if fresh {
                link(&mut heap, s.0);
            }
            lstr::fix_string(&mut heap, s);
            tm_names.push(s);
        }
        let (memerr, fresh) = strings.new_string(&mut heap, b"not enough memory", white);
        if fresh {
            link(&mut heap, memerr.0);
        }
        lstr::fix_string(&mut heap, memerr);
        let (errerr, fresh) = strings.new_string(&mut heap, b"error in error handling", white);
        if fresh {
            link(&mut heap, errerr.0);
        }
        lstr::fix_string(&mut heap, errerr);

        gcstate.allgc = allgc;

        Box::new(Runtime {
            heap,
            strings,
            gc: gcstate,
            registry,
            globals,
            main_thread: main_ref,
            current: main_ref,
            metatables: [None; crate::value::NUM_TYPES],
            tm_names: tm_names.try_into().expect("one name per event"),
            memerr,
            errerr,
            twups: Vec::new(),
            panic: default_panic,
            _not_send: std::marker::PhantomData,
        })
    }

    // ==================================================================
    // Thread access
    // ==================================================================

    pub fn th(&self) -> &Thread {
        self.heap.thread(self.current)
    }

    pub fn th_mut(&mut self) -> &mut Thread {
        let cur = self.current;
        self.heap.thread_mut(cur)
    }

    /// Value at the current top (diagnostics).
    pub fn top_value(&self) -> Value {
        let th = self.th();
        if th.top == 0 { Value::Nil } else { th.stack[th.top - 1] }
    }

    pub fn describe_value(&self, v: Value) -> Option<String> {
        match v {
            Value::Str(s) => Some(String::from_utf8_lossy(&self.heap.str(s).bytes).into_owned()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(selune_core::numeric::float_to_display(f)),
            _ => None,
        }
    }

    // ==================================================================
    // Stack discipline
    // ==================================================================

    /// Guarantee `n` free slots above the current top, growing the
    /// stack geometrically up to the hard limit.
    pub fn ensure_stack(&mut self, n: usize) -> RtResult<()> {
        let th = self.th();
        if th.top + n <= th.stack_last() {
            return Ok(());
        }
        self.grow_stack(n)
    }

    fn grow_stack(&mut self, n: usize) -> RtResult<()> {
        let cur = self.current;
        let (old_len, top) = {
            let th = self.heap.thread(cur);
            (th.stack.len(), th.top)
        };
        if old_len > MAX_STACK {
            // Already in overflow handling; a second overflow is fatal
            // for this thread's error handler.
            return Err(Control::error(Status::ErrErr, Value::Str(self.errerr)));
        }
        let needed = top + n + EXTRA_STACK;
        if needed > MAX_STACK {
            // Report the overflow, leaving the reserve usable for the
            // error handler.
            self.resize_stack((MAX_STACK + ERROR_STACK_EXTRA).max(old_len));
            return Err(self.stack_overflow_error());
        }
        let new_len = (old_len * 2).max(needed).min(MAX_STACK);
        self.resize_stack(new_len);
        Ok(())
    }

    fn resize_stack(&mut self, new_len: usize) {
        let cur = self.current;
        let th = self.heap.thread_mut(cur);
        let old = th.stack.len();
        th.stack.resize(new_len, Value::Nil);
        let delta =
            (new_len as isize - old as isize) * std::mem::size_of::<Value>() as isize;
        self.heap.account(delta);
    }

    /// Release grossly oversized stack storage after an unwind. Never
    /// cuts below any live frame ceiling.
    pub(crate) fn shrink_stack(&mut self) {
        let th = self.th();
        let in_use = th
            .ci
            .iter()
            .map(|ci| ci.top)
            .max()
            .unwrap_or(0)
            .max(th.top);
        let len = th.stack.len();
        if len > 4 * MIN_STACK && in_use <= len / 4 {
            let target = (in_use * 2).max(2 * MIN_STACK) + EXTRA_STACK;
            self.resize_stack(target);
        }
    }

    fn stack_overflow_error(&mut self) -> Control {
        let located = crate::ldebug::where_prefix(self, "stack overflow");
        let msg = self.new_string_value(&located);
        crate::call::error_msg(self, msg)
    }

    /// Push a value (host API path: errors instead of growing past the
    /// limit).
    pub fn push_value(&mut self, v: Value) -> RtResult<()> {
        self.ensure_stack(1)?;
        let th = self.th_mut();
        let top = th.top;
        th.stack[top] = v;
        th.top = top + 1;
        Ok(())
    }

    /// Guard one level of reentrant native call depth.
    pub fn enter_native_call(&mut self) -> RtResult<()> {
        let th = self.th_mut();
        th.n_ccalls += 1;
        if th.n_ccalls >= MAX_NATIVE_CALLS {
            if th.n_ccalls == MAX_NATIVE_CALLS {
                let msg = self.new_string_value("stack overflow");
                return Err(Control::error(Status::ErrRun, msg));
            }
            // Overflow while handling overflow.
            return Err(Control::error(Status::ErrErr, Value::Str(self.errerr)));
        }
        Ok(())
    }

    pub fn leave_native_call(&mut self) {
        let th = self.th_mut();
        debug_assert!(th.n_ccalls > 0);
        th.n_ccalls -= 1;
    }

    // ==================================================================
    // Object constructors
    // ==================================================================

    /// One incremental GC step when debt demands it. Called before
    /// allocations on the hot paths.
    pub fn check_gc(&mut self) {
        if self.heap.debt > 0 && self.gc.running && !self.gc.stepping {
            gc::step(self);
        }
    }

    fn link_allgc(&mut self, r: GcRef) {
        self.heap.header_mut(r).next = self.gc.allgc;
        self.gc.allgc = Some(r);
    }

    pub fn new_string(&mut self, bytes: &[u8]) -> StrRef {
        self.check_gc();
        let white = self.gc.current_white;
        let (s, fresh) = self.strings.new_string(&mut self.heap, bytes, white);
        if fresh {
            self.link_allgc(s.0);
        }
        s
    }

    /// String creation through the address-keyed API cache.
    pub fn new_string_api(&mut self, bytes: &[u8]) -> StrRef {
        self.check_gc();
        let white = self.gc.current_white;
        let (s, fresh) = self.strings.new_string_cached(&mut self.heap, bytes, white);
        if fresh {
            self.link_allgc(s.0);
        }
        s
    }

    pub fn new_string_value(&mut self, s: &str) -> Value {
        Value::Str(self.new_string(s.as_bytes()))
    }

    pub fn new_table(&mut self, narray: usize, nhash: usize) -> TableRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = TableRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Table(Table::with_capacity(narray, nhash)),
        }));
        self.link_allgc(r.0);
        r
    }

    pub fn new_lclosure(&mut self, cl: LClosure) -> ClosureRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = ClosureRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Closure(cl),
        }));
        self.link_allgc(r.0);
        r
    }

    pub fn new_nclosure(&mut self, f: NativeFn, upvals: Vec<Value>) -> NativeClosRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = NativeClosRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::NativeClosure(NClosure { f, upvals }),
        }));
        self.link_allgc(r.0);
        r
    }

    pub fn new_userdata(&mut self, size: usize) -> UdRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = UdRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Userdata(Userdata {
                data: vec![0; size],
                metatable: None,
                user_value: Value::Nil,
            }),
        }));
        self.link_allgc(r.0);
        r
    }

    pub fn new_proto(&mut self, p: Proto) -> ProtoRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = ProtoRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Proto(p),
        }));
        self.link_allgc(r.0);
        r
    }

    pub fn new_thread(&mut self) -> ThreadRef {
        self.check_gc();
        let white = self.gc.current_white;
        let r = ThreadRef(self.heap.insert(GcObject {
            header: GcHeader { marked: white, next: None },
            data: ObjData::Thread(Box::new(Thread::fresh())),
        }));
        self.link_allgc(r.0);
        r
    }

    // ==================================================================
    // Metatables
    // ==================================================================

    /// The metatable governing `v`: own for tables and userdata, the
    /// per-type fallback otherwise.
    pub fn metatable_of(&self, v: &Value) -> Option<TableRef> {
        match v {
            Value::Table(t) => self.heap.table(*t).metatable,
            Value::Userdata(u) => self.heap.userdata(*u).metatable,
            other => self.metatables[other.type_of() as usize],
        }
    }

    /// Metamethod `tm` applicable to `v`, or nil.
    pub fn tm_of(&mut self, v: &Value, tm: Tm) -> Value {
        match self.metatable_of(v) {
            None => Value::Nil,
            Some(mt) => {
                let seed = self.strings.seed;
                crate::meta::fast_tm(&mut self.heap, seed, &self.tm_names, mt, tm)
            }
        }
    }

    pub fn set_basic_metatable(&mut self, ty: Type, mt: Option<TableRef>) {
        self.metatables[ty as usize] = mt;
    }

    // ==================================================================
    // Raw table access with GC accounting
    // ==================================================================

    /// Raw `t[k] = v` with barrier and re-accounting; the caller has
    /// validated the key or accepts the error mapping.
    pub fn table_set(
        &mut self,
        t: TableRef,
        key: Value,
        value: Value,
    ) -> Result<(), crate::table::TableError> {
        let seed = self.strings.seed;
        let mut tbl = self.heap.take_table(t);
        let before = tbl.array.len() * std::mem::size_of::<Value>()
            + tbl.nodes.len() * std::mem::size_of::<crate::table::Node>();
        let r = tbl.set(&mut self.heap, seed, key, value);
        let after = tbl.array.len() * std::mem::size_of::<Value>()
            + tbl.nodes.len() * std::mem::size_of::<crate::table::Node>();
        self.heap.put_table(t, tbl);
        self.heap.account(after as isize - before as isize);
        if r.is_ok() {
            gc::barrier_back_table(self, t, &value, &key);
        }
        r
    }

    pub fn table_get(&self, t: TableRef, key: &Value) -> Value {
        self.heap.table(t).get(&self.heap, self.strings.seed, key)
    }

    pub fn table_get_str(&self, t: TableRef, s: StrRef) -> Value {
        self.heap.table(t).get_str(&self.heap, self.strings.seed, s)
    }

    /// Read a global by name (host convenience).
    pub fn global_get(&mut self, name: &str) -> Value {
        let s = self.new_string(name.as_bytes());
        self.table_get_str(self.globals, s)
    }

    pub fn global_set(&mut self, name: &str, v: Value) {
        let s = self.new_string(name.as_bytes());
        self.table_set(self.globals, Value::Str(s), v)
            .expect("string keys are always valid");
    }

    // ==================================================================
    // Strings utilities
    // ==================================================================

    pub fn str_bytes(&self, s: StrRef) -> &[u8] {
        &self.heap.str(s).bytes
    }

    /// Value as displayable text per `tostring` rules, without
    /// metamethods.
    pub fn display_value(&self, v: &Value) -> String {
        use selune_core::numeric;
        match v {
            Value::Nil => "nil".into(),
            Value::Bool(true) => "true".into(),
            Value::Bool(false) => "false".into(),
            Value::Int(i) => numeric::int_to_display(*i),
            Value::Float(f) => numeric::float_to_display(*f),
            Value::Str(s) => String::from_utf8_lossy(self.str_bytes(*s)).into_owned(),
            Value::Table(r) => format!("table: 0x{:08x}", ref_bits(r.0)),
            Value::Closure(r) => format!("function: 0x{:08x}", ref_bits(r.0)),
            Value::NativeClosure(r) => format!("function: 0x{:08x}", ref_bits(r.0)),
            Value::NativeFn(f) => format!("function: builtin: 0x{:08x}", *f as usize as u32),
            Value::Userdata(r) => format!("userdata: 0x{:08x}", ref_bits(r.0)),
            Value::Thread(r) => format!("thread: 0x{:08x}", ref_bits(r.0)),
            Value::LightUserdata(p) => format!("userdata: 0x{:08x}", *p as u32),
        }
    }
}

fn ref_bits(r: GcRef) -> u32 {
    r.idx.wrapping_mul(0x01000193) ^ r.r#gen
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("live_objects", &self.heap.live_objects())
            .field("total_bytes", &self.heap.total_bytes)
            .finish()
    }
}
