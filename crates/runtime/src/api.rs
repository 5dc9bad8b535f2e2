//! The host embedding interface: an operand-stack API over the current
//! thread.
//!
//! Operands are named by signed stack index — `1..top` from the frame
//! bottom, `-1..-top` from the top — plus pseudo-indices for the
//! registry and for the upvalues of the running native function.
//! Every entry point validates its indices; stack room for pushes is
//! the caller's contract (`check_stack`), with pushes failing loudly
//! past the hard limit.

use selune_core::limits::MULTRET;

use crate::call;
use crate::coroutine::{self, CoStatus};
use crate::error::{Control, RtResult, Status};
use crate::func::{upval_get, upval_set};
use crate::gc;
use crate::heap::{TableRef, ThreadRef, UdRef};
use crate::ldebug;
use crate::load;
use crate::meta::Tm;
use crate::ops;
use crate::state::{CallFlags, FrameKind, HookFn, PanicFn, Runtime};
use crate::value::{NativeFn, NativeK, Type, Value};

/// Pseudo-index addressing the registry.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Pseudo-index of upvalue `i` (1-based) of the running native
/// function.
pub const fn upvalue_index(i: u32) -> i32 {
    REGISTRY_INDEX - i as i32
}

/// GC control operations for `gc_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOp {
    Stop,
    Restart,
    Collect,
    /// Bytes in use, in kilobytes.
    Count,
    /// Remainder of bytes in use modulo 1024.
    CountBytes,
    Step,
    SetPause,
    SetStepMul,
    IsRunning,
}

impl Runtime {
    // ==================================================================
    // Index resolution
    // ==================================================================

    fn frame_base(&self) -> usize {
        self.th().frame().func
    }

    /// Turn a relative index into an absolute one (no pseudo-indices).
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            (self.get_top() as i32) + idx + 1
        }
    }

    fn slot_of(&self, idx: i32) -> Option<usize> {
        let func = self.frame_base();
        if idx > 0 {
            let slot = func + idx as usize;
            if slot < self.th().top { Some(slot) } else { None }
        } else if idx > REGISTRY_INDEX && idx < 0 {
            let top = self.th().top;
            let slot = top as i64 + idx as i64;
            if slot as usize > func && slot > 0 { Some(slot as usize) } else { None }
        } else {
            None
        }
    }

    /// Read the value at `idx`, resolving pseudo-indices.
    pub fn value_at(&self, idx: i32) -> Value {
        if idx == REGISTRY_INDEX {
            return Value::Table(self.registry);
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx - 1) as usize;
            let func = self.th().stack[self.frame_base()];
            return match func {
                Value::NativeClosure(c) => self
                    .heap
                    .native_closure(c)
                    .upvals
                    .get(n)
                    .copied()
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            };
        }
        match self.slot_of(idx) {
            Some(slot) => self.th().stack[slot],
            None => Value::Nil,
        }
    }

    fn write_at(&mut self, idx: i32, v: Value) {
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx - 1) as usize;
            let func = self.th().stack[self.frame_base()];
            if let Value::NativeClosure(c) = func {
                self.heap.native_closure_mut(c).upvals[n] = v;
                gc::barrier_forward_value(self, c.0, &v);
            }
            return;
        }
        if let Some(slot) = self.slot_of(idx) {
            self.th_mut().stack[slot] = v;
        }
    }

    // ==================================================================
    // Stack shape
    // ==================================================================

    /// Number of values above the current frame's function slot.
    pub fn get_top(&self) -> usize {
        self.th().top - (self.frame_base() + 1)
    }

    /// Grow or shrink the apparent stack; growing fills with nil.
    pub fn set_top(&mut self, idx: i32) {
        let func = self.frame_base();
        let new_top = if idx >= 0 {
            func + 1 + idx as usize
        } else {
            (self.th().top as i64 + idx as i64 + 1) as usize
        };
        let th = self.th_mut();
        if new_top > th.top {
            for i in th.top..new_top {
                th.stack[i] = Value::Nil;
            }
        } else {
            for i in new_top..th.top {
                th.stack[i] = Value::Nil;
            }
        }
        th.top = new_top;
    }

    pub fn pop(&mut self, n: usize) {
        self.set_top(-(n as i32) - 1);
    }

    /// Ensure room for `n` more pushes. Returns false when the hard
    /// limit forbids it.
    pub fn check_stack(&mut self, n: usize) -> bool {
        self.ensure_stack(n).is_ok()
    }

    /// Copy the value at `idx` onto the top.
    pub fn push_index(&mut self, idx: i32) -> RtResult<()> {
        let v = self.value_at(idx);
        self.push_value(v)
    }

    /// Rotate the `n` (or all) values between `idx` and the top by
    /// `shift` positions (positive toward the top).
    pub fn rotate(&mut self, idx: i32, shift: i32) {
        let Some(start) = self.slot_of(idx) else { return };
        let top = self.th().top;
        let seg = &mut self.th_mut().stack[start..top];
        let len = seg.len();
        if len == 0 {
            return;
        }
        let shift = shift.rem_euclid(len as i32) as usize;
        seg.rotate_right(shift);
    }

    pub fn remove(&mut self, idx: i32) {
        self.rotate(idx, -1);
        self.pop(1);
    }

    pub fn insert(&mut self, idx: i32) {
        self.rotate(idx, 1);
    }

    pub fn replace(&mut self, idx: i32) {
        let v = self.value_at(-1);
        self.write_at(idx, v);
        self.pop(1);
    }

    pub fn copy(&mut self, from: i32, to: i32) {
        let v = self.value_at(from);
        self.write_at(to, v);
    }

    /// Move the top `n` values from the current thread to `to`.
    pub fn xmove(&mut self, to: ThreadRef, n: usize) {
        if to == self.current {
            return;
        }
        let mut values = Vec::with_capacity(n);
        {
            let th = self.th_mut();
            for i in (th.top - n)..th.top {
                values.push(th.stack[i]);
            }
            th.top -= n;
        }
        let dest = self.heap.thread_mut(to);
        for v in values {
            let top = dest.top;
            dest.stack[top] = v;
            dest.top = top + 1;
        }
    }

    // ==================================================================
    // Push operations
    // ==================================================================

    pub fn push_nil(&mut self) -> RtResult<()> {
        self.push_value(Value::Nil)
    }

    pub fn push_bool(&mut self, b: bool) -> RtResult<()> {
        self.push_value(Value::Bool(b))
    }

    pub fn push_int(&mut self, i: i64) -> RtResult<()> {
        self.push_value(Value::Int(i))
    }

    pub fn push_float(&mut self, f: f64) -> RtResult<()> {
        self.push_value(Value::Float(f))
    }

    pub fn push_str(&mut self, s: &str) -> RtResult<()> {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> RtResult<()> {
        let s = self.new_string_api(bytes);
        self.push_value(Value::Str(s))
    }

    pub fn push_native(&mut self, f: NativeFn) -> RtResult<()> {
        self.push_value(Value::NativeFn(f))
    }

    /// Pop `nup` values into the upvalues of a new native closure and
    /// push it.
    pub fn push_native_closure(&mut self, f: NativeFn, nup: usize) -> RtResult<()> {
        if nup == 0 {
            return self.push_native(f);
        }
        let mut upvals = Vec::with_capacity(nup);
        {
            let th = self.th();
            for i in (th.top - nup)..th.top {
                upvals.push(th.stack[i]);
            }
        }
        self.th_mut().top -= nup;
        let c = self.new_nclosure(f, upvals);
        self.push_value(Value::NativeClosure(c))
    }

    pub fn push_light_userdata(&mut self, p: usize) -> RtResult<()> {
        self.push_value(Value::LightUserdata(p))
    }

    /// Push the current thread; reports whether it is the main one.
    pub fn push_thread(&mut self) -> RtResult<bool> {
        let cur = self.current;
        self.push_value(Value::Thread(cur))?;
        Ok(cur == self.main_thread)
    }

    // ==================================================================
    // Access operations
    // ==================================================================

    pub fn type_at(&self, idx: i32) -> Option<Type> {
        if idx == REGISTRY_INDEX || idx < REGISTRY_INDEX {
            return Some(self.value_at(idx).type_of());
        }
        self.slot_of(idx).map(|s| self.th().stack[s].type_of())
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).truthy()
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        match ops::to_number(self, &self.value_at(idx))? {
            selune_core::numeric::Number::Int(i) => Some(i as f64),
            selune_core::numeric::Number::Float(f) => Some(f),
        }
    }

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        ops::to_integer(self, &self.value_at(idx))
    }

    /// String bytes at `idx`; numbers convert (without mutating the
    /// slot, unlike the C API).
    pub fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        match self.value_at(idx) {
            Value::Str(s) => Some(self.str_bytes(s).to_vec()),
            Value::Int(i) => Some(i.to_string().into_bytes()),
            Value::Float(f) => {
                Some(selune_core::numeric::float_to_display(f).into_bytes())
            }
            _ => None,
        }
    }

    pub fn to_rust_string(&self, idx: i32) -> Option<String> {
        self.to_bytes(idx).map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Raw length without metamethods.
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.value_at(idx) {
            Value::Str(s) => self.str_bytes(s).len(),
            Value::Table(t) => self.heap.table(t).length() as usize,
            Value::Userdata(u) => self.heap.userdata(u).data.len(),
            _ => 0,
        }
    }

    pub fn to_thread(&self, idx: i32) -> Option<ThreadRef> {
        match self.value_at(idx) {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_userdata(&self, idx: i32) -> Option<UdRef> {
        match self.value_at(idx) {
            Value::Userdata(u) => Some(u),
            _ => None,
        }
    }

    /// The bare function pointer behind a native function or closure.
    pub fn to_native_fn(&self, idx: i32) -> Option<NativeFn> {
        match self.value_at(idx) {
            Value::NativeFn(f) => Some(f),
            Value::NativeClosure(c) => Some(self.heap.native_closure(c).f),
            _ => None,
        }
    }

    /// Opaque identity for debugging/printing.
    pub fn to_pointer(&self, idx: i32) -> usize {
        match self.value_at(idx).gc_ref() {
            Some(r) => (r.idx as usize) << 8 | (r.r#gen as usize & 0xFF),
            None => 0,
        }
    }

    pub fn raw_equal(&mut self, a: i32, b: i32) -> bool {
        let va = self.value_at(a);
        let vb = self.value_at(b);
        match (&va, &vb) {
            (Value::Str(x), Value::Str(y)) => crate::lstr::str_eq(&self.heap, *x, *y),
            _ => va.raw_eq_non_string(&vb),
        }
    }

    // ==================================================================
    // Table operations
    // ==================================================================

    pub fn create_table(&mut self, narray: usize, nhash: usize) -> RtResult<()> {
        let t = self.new_table(narray, nhash);
        self.push_value(Value::Table(t))
    }

    /// `t[k]` with metamethods; pushes the result, returns its type.
    pub fn get_table(&mut self, idx: i32) -> RtResult<Type> {
        let t = self.value_at(idx);
        let key = self.value_at(-1);
        let res = self.th().top - 1; // overwrite the key slot
        ops::index_get(self, t, key, res)?;
        Ok(self.th().stack[res].type_of())
    }

    pub fn set_table(&mut self, idx: i32) -> RtResult<()> {
        let t = self.value_at(idx);
        let key = self.value_at(-2);
        let v = self.value_at(-1);
        ops::index_set(self, t, key, v)?;
        self.pop(2);
        Ok(())
    }

    pub fn get_field(&mut self, idx: i32, name: &str) -> RtResult<Type> {
        let t = self.value_at(idx);
        let key = Value::Str(self.new_string_api(name.as_bytes()));
        self.push_value(Value::Nil)?;
        let res = self.th().top - 1;
        ops::index_get(self, t, key, res)?;
        Ok(self.th().stack[res].type_of())
    }

    pub fn set_field(&mut self, idx: i32, name: &str) -> RtResult<()> {
        let t = self.value_at(idx);
        let key = Value::Str(self.new_string_api(name.as_bytes()));
        let v = self.value_at(-1);
        ops::index_set(self, t, key, v)?;
        self.pop(1);
        Ok(())
    }

    pub fn get_index(&mut self, idx: i32, i: i64) -> RtResult<Type> {
        let t = self.value_at(idx);
        self.push_value(Value::Nil)?;
        let res = self.th().top - 1;
        ops::index_get(self, t, Value::Int(i), res)?;
        Ok(self.th().stack[res].type_of())
    }

    pub fn set_index(&mut self, idx: i32, i: i64) -> RtResult<()> {
        let t = self.value_at(idx);
        let v = self.value_at(-1);
        ops::index_set(self, t, Value::Int(i), v)?;
        self.pop(1);
        Ok(())
    }

    fn table_at(&mut self, idx: i32) -> RtResult<TableRef> {
        match self.value_at(idx) {
            Value::Table(t) => Ok(t),
            other => Err(ldebug::type_error(self, &other, "index")),
        }
    }

    pub fn raw_get(&mut self, idx: i32) -> RtResult<Type> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        let v = self.table_get(t, &key);
        let top = self.th().top;
        self.th_mut().stack[top - 1] = v;
        Ok(v.type_of())
    }

    pub fn raw_set(&mut self, idx: i32) -> RtResult<()> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-2);
        let v = self.value_at(-1);
        ops::raw_set_checked(self, t, key, v)?;
        self.pop(2);
        Ok(())
    }

    pub fn raw_get_index(&mut self, idx: i32, i: i64) -> RtResult<Type> {
        let t = self.table_at(idx)?;
        let v = self.heap.table(t).get_int(i);
        self.push_value(v)?;
        Ok(v.type_of())
    }

    pub fn raw_set_index(&mut self, idx: i32, i: i64) -> RtResult<()> {
        let t = self.table_at(idx)?;
        let v = self.value_at(-1);
        ops::raw_set_checked(self, t, Value::Int(i), v)?;
        self.pop(1);
        Ok(())
    }

    /// Pop a key, push the next key/value pair; false at the end.
    pub fn next_entry(&mut self, idx: i32) -> RtResult<bool> {
        let t = self.table_at(idx)?;
        let key = self.value_at(-1);
        let seed = self.strings.seed;
        let next = self
            .heap
            .table(t)
            .next(&self.heap, seed, &key)
            .map_err(|_| ldebug::run_error(self, "invalid key to 'next'".into()))?;
        self.pop(1);
        match next {
            Some((k, v)) => {
                self.push_value(k)?;
                self.push_value(v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `#v` with metamethods; pushes the length.
    pub fn len_of(&mut self, idx: i32) -> RtResult<()> {
        let v = self.value_at(idx);
        self.push_value(Value::Nil)?;
        let res = self.th().top - 1;
        ops::object_len(self, v, res)
    }

    pub fn get_global_field(&mut self, name: &str) -> RtResult<Type> {
        let g = self.globals;
        let key = Value::Str(self.new_string_api(name.as_bytes()));
        self.push_value(Value::Nil)?;
        let res = self.th().top - 1;
        ops::index_get(self, Value::Table(g), key, res)?;
        Ok(self.th().stack[res].type_of())
    }

    pub fn set_global_field(&mut self, name: &str) -> RtResult<()> {
        let g = self.globals;
        let key = Value::Str(self.new_string_api(name.as_bytes()));
        let v = self.value_at(-1);
        ops::index_set(self, Value::Table(g), key, v)?;
        self.pop(1);
        Ok(())
    }

    // ==================================================================
    // Metatables and userdata
    // ==================================================================

    /// Push the metatable of the value at `idx`; false (and nothing
    /// pushed) when it has none.
    pub fn get_metatable_api(&mut self, idx: i32) -> RtResult<bool> {
        let v = self.value_at(idx);
        match self.metatable_of(&v) {
            Some(mt) => {
                self.push_value(Value::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and set it as the metatable of the value
    /// at `idx`.
    pub fn set_metatable_api(&mut self, idx: i32) -> RtResult<()> {
        let v = self.value_at(idx);
        let mt = match self.value_at(-1) {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            _ => return Err(ldebug::run_error(self, "nil or table expected".into())),
        };
        match v {
            Value::Table(t) => {
                self.heap.table_mut(t).metatable = mt;
                self.heap.table_mut(t).flags = 0;
                if let Some(mt) = mt {
                    gc::barrier_forward(self, t.0, mt.0);
                }
                gc::check_finalizer(self, &v);
            }
            Value::Userdata(u) => {
                self.heap.userdata_mut(u).metatable = mt;
                if let Some(mt) = mt {
                    gc::barrier_forward(self, u.0, mt.0);
                }
                gc::check_finalizer(self, &v);
            }
            other => {
                self.metatables[other.type_of() as usize] = mt;
            }
        }
        self.pop(1);
        Ok(())
    }

    pub fn new_userdata_api(&mut self, size: usize) -> RtResult<UdRef> {
        let u = self.new_userdata(size);
        self.push_value(Value::Userdata(u))?;
        Ok(u)
    }

    pub fn get_user_value(&mut self, idx: i32) -> RtResult<()> {
        match self.value_at(idx) {
            Value::Userdata(u) => {
                let v = self.heap.userdata(u).user_value;
                self.push_value(v)
            }
            _ => self.push_nil(),
        }
    }

    pub fn set_user_value(&mut self, idx: i32) -> RtResult<()> {
        let v = self.value_at(-1);
        if let Value::Userdata(u) = self.value_at(idx) {
            self.heap.userdata_mut(u).user_value = v;
            gc::barrier_forward_value(self, u.0, &v);
        }
        self.pop(1);
        Ok(())
    }

    // ==================================================================
    // Calls
    // ==================================================================

    /// Call with `nargs` arguments and `nresults` expected results
    /// (`MULTRET` for all). The function sits under its arguments.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> RtResult<()> {
        self.call_k(nargs, nresults, 0, None)
    }

    /// Like `call`, but a yield crossing this frame resumes into `k`.
    pub fn call_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        ctx: i64,
        k: Option<NativeK>,
    ) -> RtResult<()> {
        let func = self.th().top - nargs - 1;
        if k.is_some() && self.th().nny == 0 {
            if let FrameKind::Native { k: slot_k, ctx: slot_ctx, .. } =
                &mut self.th_mut().frame_mut().kind
            {
                *slot_k = k;
                *slot_ctx = ctx;
            }
            call::call_value(self, func, nresults)?;
        } else {
            call::call_no_yield(self, func, nresults)?;
        }
        self.adjust_results(nresults);
        Ok(())
    }

    /// Protected call; on error the error object replaces function and
    /// arguments.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> Status {
        match self.pcall_k(nargs, nresults, errfunc, 0, None) {
            Ok(status) => status,
            Err(_) => unreachable!("non-yieldable pcall cannot unwind"),
        }
    }

    /// Yieldable protected call: if the body yields, the error/success
    /// continues through `k` on resume.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        errfunc: i32,
        ctx: i64,
        k: Option<NativeK>,
    ) -> RtResult<Status> {
        let func = self.th().top - nargs - 1;
        let errfunc_slot = if errfunc == 0 {
            0
        } else {
            self.slot_of(errfunc).unwrap_or(0)
        };
        if k.is_none() || self.th().nny > 0 {
            let status = call::pcall_at(self, func, nresults, errfunc_slot);
            self.adjust_results(nresults);
            return Ok(status);
        }
        // Yieldable: arm the current native frame for recovery and run
        // unprotected; pre-yield errors unwind to the resume, which
        // recovers to this frame.
        let allow = self.th().allow_hook;
        {
            let th = self.th_mut();
            let old_errfunc = th.errfunc;
            th.errfunc = errfunc_slot;
            let frame = th.frame_mut();
            frame.extra = func;
            frame.flags |= CallFlags::YPCALL;
            if allow {
                frame.flags |= CallFlags::OAH;
            } else {
                frame.flags &= !CallFlags::OAH;
            }
            if let FrameKind::Native { k: slot_k, ctx: slot_ctx, old_errfunc: slot_old } =
                &mut frame.kind
            {
                *slot_k = k;
                *slot_ctx = ctx;
                *slot_old = old_errfunc;
            }
        }
        call::call_value(self, func, nresults)?;
        let old_errfunc = match self.th().frame().kind {
            FrameKind::Native { old_errfunc, .. } => old_errfunc,
            _ => 0,
        };
        self.th_mut().frame_mut().flags &= !CallFlags::YPCALL;
        self.th_mut().errfunc = old_errfunc;
        self.adjust_results(nresults);
        Ok(Status::Ok)
    }

    fn adjust_results(&mut self, nresults: i32) {
        if nresults == MULTRET {
            let top = self.th().top;
            if self.th().frame().top < top {
                self.th_mut().frame_mut().top = top;
            }
        }
    }

    /// Raise an error with the value on top.
    pub fn error_api(&mut self) -> Control {
        let v = self.value_at(-1);
        self.pop(1);
        call::error_msg(self, v)
    }

    // ==================================================================
    // Load and dump
    // ==================================================================

    /// Load a chunk and push the resulting function; on failure the
    /// error message is pushed instead.
    pub fn load_buffer(&mut self, source: &[u8], chunk_name: &[u8], mode: &str) -> Status {
        match load::load_chunk(self, source, chunk_name, mode) {
            Ok(cl) => {
                self.push_value(Value::Closure(cl)).expect("room for one value");
                Status::Ok
            }
            Err(Control::Error(e)) => {
                let obj = call::error_object(self, e.status, e.value);
                self.push_value(obj).expect("room for one value");
                e.status
            }
            Err(Control::Yield) => unreachable!("load does not yield"),
        }
    }

    /// Serialize the script function on top. `None` for values that
    /// cannot be dumped.
    pub fn dump_top(&mut self, strip: bool) -> Option<Vec<u8>> {
        match self.value_at(-1) {
            Value::Closure(cl) => Some(load::dump_closure(self, cl, strip)),
            _ => None,
        }
    }

    // ==================================================================
    // GC control
    // ==================================================================

    pub fn gc_control(&mut self, op: GcOp, data: usize) -> i64 {
        match op {
            GcOp::Stop => {
                self.gc.running = false;
                0
            }
            GcOp::Restart => {
                self.gc.running = true;
                self.heap.debt = 0;
                0
            }
            GcOp::Collect => {
                gc::full_gc(self, false);
                0
            }
            GcOp::Count => (self.heap.total_bytes / 1024) as i64,
            GcOp::CountBytes => (self.heap.total_bytes % 1024) as i64,
            GcOp::Step => {
                let was_running = self.gc.running;
                self.gc.running = true;
                if data > 0 {
                    self.heap.debt += (data * 1024) as isize;
                } else {
                    self.heap.debt = self.heap.debt.max(1);
                }
                gc::step(self);
                self.gc.running = was_running;
                // Report reaching the end of a cycle.
                (self.gc.phase == crate::gc::Phase::Pause) as i64
            }
            GcOp::SetPause => {
                let old = self.gc.pause;
                self.gc.pause = data as u32;
                old as i64
            }
            GcOp::SetStepMul => {
                let old = self.gc.stepmul;
                self.gc.stepmul = data as u32;
                old as i64
            }
            GcOp::IsRunning => self.gc.running as i64,
        }
    }

    // ==================================================================
    // Coroutines
    // ==================================================================

    /// Create a suspended thread and push it.
    pub fn new_thread_api(&mut self) -> RtResult<ThreadRef> {
        let t = self.new_thread();
        self.push_value(Value::Thread(t))?;
        Ok(t)
    }

    /// Resume `co`, passing the top `nargs` values. Results (or the
    /// error object) are moved back onto the current stack; the count
    /// is returned with the status.
    pub fn resume(&mut self, co: ThreadRef, nargs: usize) -> (Status, usize) {
        // Stage arguments on the coroutine's stack.
        {
            let prev = self.current;
            self.current = co;
            let ok = self.ensure_stack(nargs + 1).is_ok();
            self.current = prev;
            if !ok {
                let v = self.new_string_value("stack overflow");
                self.pop(nargs);
                self.push_value(v).expect("freed room");
                return (Status::ErrRun, 1);
            }
        }
        self.xmove(co, nargs);
        let status = coroutine::resume(self, co, nargs);
        let nres = coroutine::result_count(self, co, status);
        // Harvest results back.
        let _ = self.ensure_stack(nres);
        let prev = self.current;
        self.current = co;
        self.xmove(prev, nres);
        self.current = prev;
        (status, nres)
    }

    /// Yield from the current coroutine with the top `nresults`
    /// values. The returned control must be propagated as an `Err`.
    pub fn yield_k(&mut self, nresults: usize, ctx: i64, k: Option<NativeK>) -> Control {
        coroutine::do_yield(self, nresults, k, ctx)
    }

    pub fn co_status(&self, co: ThreadRef) -> CoStatus {
        coroutine::status_of(self, co)
    }

    pub fn is_yieldable(&self) -> bool {
        coroutine::is_yieldable(self)
    }

    // ==================================================================
    // Debug interface
    // ==================================================================

    pub fn set_hook(&mut self, hook: Option<HookFn>, mask: u8, count: u32) {
        let th = self.th_mut();
        th.hook = hook;
        th.hook_mask = if hook.is_some() { mask } else { 0 };
        th.base_hook_count = count;
        th.hook_count = count;
    }

    pub fn get_stack_api(&self, level: usize) -> Option<usize> {
        ldebug::get_stack(self, level)
    }

    pub fn get_info_api(&self, ci_idx: usize) -> ldebug::DebugInfo {
        ldebug::get_info(self, ci_idx)
    }

    pub fn traceback_api(&self, msg: Option<&str>, level: usize) -> String {
        ldebug::traceback(self, msg, level)
    }

    /// Name and value of local `n` (1-based) of the frame `ci_idx`;
    /// pushes the value.
    pub fn get_local(&mut self, ci_idx: usize, n: u32) -> RtResult<Option<String>> {
        let frame = self.th().ci.get(ci_idx).cloned();
        let Some(frame) = frame else { return Ok(None) };
        let FrameKind::Lua { base, pc } = frame.kind else { return Ok(None) };
        let func = self.th().stack[frame.func];
        let Value::Closure(cl) = func else { return Ok(None) };
        let proto = self.heap.closure(cl).proto;
        let name = {
            let p = self.heap.proto(proto);
            p.local_name(n, pc.saturating_sub(1) as u32)
        };
        match name {
            Some(s) => {
                let text = String::from_utf8_lossy(self.str_bytes(s)).into_owned();
                let v = self.th().stack[base + (n as usize - 1)];
                self.push_value(v)?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    /// Pop a value into local `n` of frame `ci_idx`.
    pub fn set_local(&mut self, ci_idx: usize, n: u32) -> Option<String> {
        let frame = self.th().ci.get(ci_idx).cloned()?;
        let FrameKind::Lua { base, pc } = frame.kind else { return None };
        let func = self.th().stack[frame.func];
        let Value::Closure(cl) = func else { return None };
        let proto = self.heap.closure(cl).proto;
        let name = self.heap.proto(proto).local_name(n, pc.saturating_sub(1) as u32)?;
        let text = String::from_utf8_lossy(self.str_bytes(name)).into_owned();
        let v = self.value_at(-1);
        self.th_mut().stack[base + (n as usize - 1)] = v;
        self.pop(1);
        Some(text)
    }

    /// Name of upvalue `n` (1-based) of the function at `idx`; pushes
    /// its value.
    pub fn get_upvalue(&mut self, idx: i32, n: u32) -> RtResult<Option<String>> {
        match self.value_at(idx) {
            Value::Closure(cl) => {
                let (uv, name) = {
                    let c = self.heap.closure(cl);
                    let Some(uv) = c.upvals.get(n as usize - 1) else { return Ok(None) };
                    let name = self
                        .heap
                        .proto(c.proto)
                        .upvalue_names
                        .get(n as usize - 1)
                        .and_then(|s| *s);
                    (uv.clone(), name)
                };
                let v = upval_get(&self.heap, &uv);
                self.push_value(v)?;
                Ok(Some(match name {
                    Some(s) => String::from_utf8_lossy(self.str_bytes(s)).into_owned(),
                    None => String::new(),
                }))
            }
            Value::NativeClosure(c) => {
                let Some(&v) = self.heap.native_closure(c).upvals.get(n as usize - 1) else {
                    return Ok(None);
                };
                self.push_value(v)?;
                Ok(Some(String::new()))
            }
            _ => Ok(None),
        }
    }

    /// Pop a value into upvalue `n` of the function at `idx`.
    pub fn set_upvalue(&mut self, idx: i32, n: u32) -> Option<String> {
        let v = self.value_at(-1);
        match self.value_at(idx) {
            Value::Closure(cl) => {
                let uv = self.heap.closure(cl).upvals.get(n as usize - 1)?.clone();
                upval_set(&mut self.heap, &uv, v);
                gc::barrier_upvalue(self, &uv, &v);
                self.pop(1);
                Some(String::new())
            }
            Value::NativeClosure(c) => {
                if (n as usize) > self.heap.native_closure(c).upvals.len() {
                    return None;
                }
                self.heap.native_closure_mut(c).upvals[n as usize - 1] = v;
                gc::barrier_forward_value(self, c.0, &v);
                self.pop(1);
                Some(String::new())
            }
            _ => None,
        }
    }

    /// Identity of an upvalue cell, for aliasing checks.
    pub fn upvalue_id(&self, idx: i32, n: u32) -> Option<usize> {
        match self.value_at(idx) {
            Value::Closure(cl) => {
                let uv = self.heap.closure(cl).upvals.get(n as usize - 1)?;
                Some(std::rc::Rc::as_ptr(uv) as usize)
            }
            _ => None,
        }
    }

    /// Make upvalue `n1` of the closure at `idx1` share the cell of
    /// upvalue `n2` of the closure at `idx2`.
    pub fn upvalue_join(&mut self, idx1: i32, n1: u32, idx2: i32, n2: u32) {
        let (Value::Closure(c1), Value::Closure(c2)) =
            (self.value_at(idx1), self.value_at(idx2))
        else {
            return;
        };
        let Some(cell) = self.heap.closure(c2).upvals.get(n2 as usize - 1).cloned() else {
            return;
        };
        if let Some(slot) = self.heap.closure_mut(c1).upvals.get_mut(n1 as usize - 1) {
            *slot = cell;
        }
    }

    // ==================================================================
    // State lifecycle
    // ==================================================================

    pub fn at_panic(&mut self, f: PanicFn) -> PanicFn {
        std::mem::replace(&mut self.panic, f)
    }

    /// Run all pending finalizers and collect everything collectable
    /// (shutdown path).
    pub fn close(&mut self) {
        gc::finish_finalizers(self);
        gc::full_gc(self, false);
        tracing::debug!(
            target: "selune::state",
            live = self.heap.live_objects(),
            "state closed"
        );
    }

    /// Metamethod lookup for library use (`getmetatable` respecting
    /// `__metatable` is the library's concern).
    pub fn tm_by_value(&mut self, v: &Value, tm: Tm) -> Value {
        self.tm_of(v, tm)
    }
}
