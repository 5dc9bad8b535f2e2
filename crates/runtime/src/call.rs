//! Function calls, frame setup/teardown, upvalue lifecycle, and
//! protected execution.
//!
//! `precall` resolves a callee: native functions run to completion on
//! the Rust stack; script functions get a frame pushed for the VM loop.
//! `__call`able values are rewritten in place by opening a stack hole
//! for the handler. Protected calls snapshot the parts of thread state
//! an unwind must restore and deposit the error object at the saved
//! top, exactly where the caller expects it.

use std::rc::Rc;

use selune_core::limits::MIN_STACK;

use crate::error::{Control, RtResult, Status};
use crate::func::{UpvalRef, UpvalState, new_open_upval};
use crate::gc;
use crate::heap::ThreadRef;
use crate::ldebug;
use crate::meta::Tm;
use crate::state::{CallFlags, CallInfo, FrameKind, HookEvent, MASK_CALL, MASK_RET, Runtime};
use crate::value::Value;
use crate::vm;

// ======================================================================
// Upvalues
// ======================================================================

/// Find or create the open upvalue cell aliasing `slot` on the current
/// thread. The per-thread list stays sorted by descending slot.
pub fn find_upvalue(rt: &mut Runtime, slot: usize) -> UpvalRef {
    let cur = rt.current;
    let th = rt.heap.thread_mut(cur);
    let mut insert_at = th.open_upvals.len();
    for (i, (s, uv)) in th.open_upvals.iter().enumerate() {
        if *s == slot {
            return Rc::clone(uv);
        }
        if *s < slot {
            insert_at = i;
            break;
        }
    }
    let uv = new_open_upval(cur, slot);
    th.open_upvals.insert(insert_at, (slot, Rc::clone(&uv)));
    if !rt.twups.contains(&cur) {
        rt.twups.push(cur);
    }
    uv
}

/// Close every open upvalue of `thread` at or above `level`: shared
/// cells absorb their stack value; unshared cells just die.
pub fn close_upvalues(rt: &mut Runtime, thread: ThreadRef, level: usize) {
    loop {
        let th = rt.heap.thread_mut(thread);
        match th.open_upvals.first() {
            Some((slot, _)) if *slot >= level => {
                let (slot, uv) = th.open_upvals.remove(0);
                // The list holds one reference; closures hold the rest.
                if Rc::strong_count(&uv) > 1 {
                    let v = rt.heap.thread(thread).stack[slot];
                    *uv.state.borrow_mut() = UpvalState::Closed(v);
                    gc::barrier_upvalue(rt, &uv, &v);
                }
            }
            _ => return,
        }
    }
}

// ======================================================================
// Call setup / teardown
// ======================================================================

pub enum PreCall {
    /// Native function already ran; results are in place.
    Native,
    /// A script frame was pushed; the VM loop must run it.
    Lua,
}

/// Shift stack values up to open a hole at `at` for a `__call`
/// handler.
fn try_call_tm(rt: &mut Runtime, func: usize) -> RtResult<()> {
    let callee = rt.th().stack[func];
    let tm = rt.tm_of(&callee, Tm::Call);
    if !matches!(tm, Value::Closure(_) | Value::NativeClosure(_) | Value::NativeFn(_)) {
        return Err(ldebug::type_error(rt, &callee, "call"));
    }
    rt.ensure_stack(1)?;
    let th = rt.th_mut();
    let top = th.top;
    th.stack.copy_within(func..top, func + 1);
    th.top = top + 1;
    th.stack[func] = tm;
    Ok(())
}

/// Move `count` fixed parameters past the varargs so registers line up
/// at a fresh base. Returns the new base.
fn adjust_varargs(rt: &mut Runtime, num_fixed: usize, actual: usize) -> RtResult<usize> {
    rt.ensure_stack(num_fixed + 1)?;
    let th = rt.th_mut();
    let fixed = th.top - actual;
    let base = th.top;
    for i in 0..num_fixed {
        if i < actual {
            let v = th.stack[fixed + i];
            th.stack[th.top] = v;
            th.stack[fixed + i] = Value::Nil;
        } else {
            th.stack[th.top] = Value::Nil;
        }
        th.top += 1;
    }
    Ok(base)
}

/// Prepare a call to the value at stack slot `func` with the arguments
/// above it.
pub fn precall(rt: &mut Runtime, func: usize, nresults: i32) -> RtResult<PreCall> {
    loop {
        let callee = rt.th().stack[func];
        match callee {
            Value::NativeFn(_) | Value::NativeClosure(_) => {
                let f = match callee {
                    Value::NativeFn(f) => f,
                    Value::NativeClosure(c) => rt.heap.native_closure(c).f,
                    _ => unreachable!(),
                };
                rt.ensure_stack(MIN_STACK)?;
                let top = rt.th().top;
                let errfunc = rt.th().errfunc;
                rt.th_mut().ci.push(CallInfo {
                    func,
                    top: top + MIN_STACK,
                    nresults,
                    flags: CallFlags::empty(),
                    extra: 0,
                    kind: FrameKind::Native { k: None, ctx: 0, old_errfunc: errfunc },
                });
                if rt.th().hook_mask & MASK_CALL != 0 {
                    ldebug::call_hook(rt, HookEvent::Call)?;
                }
                let n = f(rt)?;
                let first = rt.th().top - n as usize;
                poscall(rt, first, n as usize)?;
                return Ok(PreCall::Native);
            }
            Value::Closure(cl) => {
                let proto_ref = rt.heap.closure(cl).proto;
                let (max_stack, num_params, is_vararg) = {
                    let p = rt.heap.proto(proto_ref);
                    (p.max_stack_size as usize, p.num_params as usize, p.is_vararg)
                };
                rt.ensure_stack(max_stack)?;
                let actual = rt.th().top - func - 1;
                // Missing arguments read as nil.
                for _ in actual..num_params {
                    let th = rt.th_mut();
                    th.stack[th.top] = Value::Nil;
                    th.top += 1;
                }
                let actual = actual.max(num_params);
                let base = if is_vararg {
                    adjust_varargs(rt, num_params, actual)?
                } else {
                    func + 1
                };
                rt.ensure_stack(max_stack)?;
                let th = rt.th_mut();
                let frame_top = base + max_stack;
                th.top = frame_top;
                th.ci.push(CallInfo {
                    func,
                    top: frame_top,
                    nresults,
                    flags: CallFlags::empty(),
                    extra: 0,
                    kind: FrameKind::Lua { base, pc: 0 },
                });
                if rt.th().hook_mask & MASK_CALL != 0 {
                    ldebug::call_hook(rt, HookEvent::Call)?;
                }
                return Ok(PreCall::Lua);
            }
            _ => {
                // Not callable: install its __call handler at the
                // callee slot and retry.
                try_call_tm(rt, func)?;
            }
        }
    }
}

/// Finish a call: fire the return hook, pop the frame, and move
/// `nres` results (starting at `first`) down to the callee slot,
/// padding or truncating to the caller's expectation.
pub fn poscall(rt: &mut Runtime, first: usize, nres: usize) -> RtResult<()> {
    if rt.th().hook_mask & MASK_RET != 0 {
        ldebug::call_hook(rt, HookEvent::Return)?;
    }
    let frame = rt.th_mut().ci.pop().expect("frame to pop");
    let res = frame.func;
    let wanted = frame.nresults;
    move_results(rt, first, res, nres, wanted);
    Ok(())
}

pub fn move_results(rt: &mut Runtime, first: usize, res: usize, nres: usize, wanted: i32) {
    let th = rt.th_mut();
    match wanted {
        0 => {
            th.top = res;
        }
        selune_core::limits::MULTRET => {
            for i in 0..nres {
                th.stack[res + i] = th.stack[first + i];
            }
            th.top = res + nres;
        }
        _ => {
            let wanted = wanted as usize;
            let n = wanted.min(nres);
            for i in 0..n {
                th.stack[res + i] = th.stack[first + i];
            }
            for i in n..wanted {
                th.stack[res + i] = Value::Nil;
            }
            th.top = res + wanted;
        }
    }
}

/// Call the value at `func` with everything above it as arguments,
/// running the VM as needed.
pub fn call_value(rt: &mut Runtime, func: usize, nresults: i32) -> RtResult<()> {
    rt.enter_native_call()?;
    let result = (|| match precall(rt, func, nresults)? {
        PreCall::Native => Ok(()),
        PreCall::Lua => vm::execute(rt),
    })();
    rt.leave_native_call();
    result
}

/// Like `call_value` but forbidding yields across it.
pub fn call_no_yield(rt: &mut Runtime, func: usize, nresults: i32) -> RtResult<()> {
    rt.th_mut().nny += 1;
    let r = call_value(rt, func, nresults);
    rt.th_mut().nny -= 1;
    r
}

// ======================================================================
// Error raising
// ======================================================================

/// Raise an error carrying `value`, first filtering it through the
/// active message handler, if any.
pub fn error_msg(rt: &mut Runtime, value: Value) -> Control {
    let errfunc = rt.th().errfunc;
    if errfunc == 0 {
        return Control::error(Status::ErrRun, value);
    }
    if rt.th().in_errfunc {
        // The handler itself failed; its error is discarded.
        return Control::error(Status::ErrErr, Value::Str(rt.errerr));
    }
    rt.th_mut().in_errfunc = true;
    let handled = (|| -> RtResult<Value> {
        let f = rt.th().stack[errfunc];
        rt.push_value(f)?;
        rt.push_value(value)?;
        let func = rt.th().top - 2;
        call_no_yield(rt, func, 1)?;
        let th = rt.th_mut();
        th.top -= 1;
        Ok(th.stack[th.top])
    })();
    rt.th_mut().in_errfunc = false;
    match handled {
        Ok(v) => Control::error(Status::ErrRun, v),
        Err(Control::Error(e)) if e.status == Status::ErrErr => Control::Error(e),
        Err(_) => Control::error(Status::ErrErr, Value::Str(rt.errerr)),
    }
}

/// Error object deposited for `status` during unwinding.
pub fn error_object(rt: &Runtime, status: Status, value: Value) -> Value {
    match status {
        Status::ErrMem => Value::Str(rt.memerr),
        Status::ErrErr => Value::Str(rt.errerr),
        _ => value,
    }
}

// ======================================================================
// Protected execution
// ======================================================================

/// Run `body` with full state restoration on error. Yields pass
/// through untouched (the innermost resume owns them).
pub fn protected_body<F>(rt: &mut Runtime, body: F) -> RtResult<()>
where
    F: FnOnce(&mut Runtime) -> RtResult<()>,
{
    let cur = rt.current;
    let saved = {
        let th = rt.th();
        (th.ci.len(), th.allow_hook, th.nny, th.errfunc, th.top, th.n_ccalls)
    };
    let result = body(rt);
    if let Err(Control::Error(e)) = &result {
        let (ci_len, allow_hook, nny, errfunc, old_top, n_ccalls) = saved;
        close_upvalues(rt, cur, old_top);
        let errobj = error_object(rt, e.status, e.value);
        let th = rt.heap.thread_mut(cur);
        th.ci.truncate(ci_len);
        th.stack[old_top] = errobj;
        // Clear the dead stack segment so the GC sees no stale refs.
        for v in &mut th.stack[old_top + 1..] {
            *v = Value::Nil;
        }
        th.top = old_top + 1;
        th.allow_hook = allow_hook;
        th.nny = nny;
        th.errfunc = errfunc;
        th.n_ccalls = n_ccalls;
    } else {
        rt.th_mut().errfunc = saved.3;
    }
    result
}

/// Protected call of the function at stack slot `func`:
/// `errfunc` is a stack slot of the message handler (0 for none).
/// On error, frames above are unwound and the error object replaces
/// the function and its arguments.
pub fn pcall_at(rt: &mut Runtime, func: usize, nresults: i32, errfunc: usize) -> Status {
    let old_errfunc = rt.th().errfunc;
    rt.th_mut().errfunc = errfunc;
    rt.th_mut().nny += 1;
    let saved_ci = rt.th().ci.len();
    let saved_ccalls = rt.th().n_ccalls;
    let saved_allow_hook = rt.th().allow_hook;
    let cur = rt.current;
    let result = call_value(rt, func, nresults);
    rt.th_mut().nny -= 1;
    match result {
        Ok(()) => {
            rt.th_mut().errfunc = old_errfunc;
            Status::Ok
        }
        Err(Control::Yield) => unreachable!("nny forbids yields through pcall"),
        Err(Control::Error(e)) => {
            close_upvalues(rt, cur, func);
            let errobj = error_object(rt, e.status, e.value);
            let th = rt.heap.thread_mut(cur);
            th.ci.truncate(saved_ci);
            th.stack[func] = errobj;
            for v in &mut th.stack[func + 1..] {
                *v = Value::Nil;
            }
            th.top = func + 1;
            th.errfunc = old_errfunc;
            th.n_ccalls = saved_ccalls;
            th.allow_hook = saved_allow_hook;
            rt.shrink_stack();
            e.status
        }
    }
}
