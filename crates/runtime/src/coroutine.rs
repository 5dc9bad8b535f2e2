//! Coroutines: stackful resume/yield with native continuations.
//!
//! A yield unwinds the Rust call stack with `Control::Yield` back to
//! the innermost `resume`. Script frames are pure data, so they simply
//! stay suspended; native frames lose their Rust state, which is why a
//! native function may only yield when it registered a continuation —
//! on resume, `unroll` walks the suspended frames top-down, finishing
//! interrupted instructions on script frames and calling continuations
//! on native ones. A protected call flagged yieldable (`YPCALL`)
//! doubles as a recovery point for errors raised after a resume.

use selune_core::limits::{MAX_NATIVE_CALLS, MULTRET};

use crate::call::{self, close_upvalues};
use crate::error::{Control, RtResult, Status};
use crate::heap::ThreadRef;
use crate::ldebug;
use crate::state::{CallFlags, FrameKind, Runtime};
use crate::value::{NativeK, Value};
use crate::vm;

/// Observable state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    Running,
    Suspended,
    /// Active but not running: it resumed another coroutine.
    Normal,
    Dead,
}

impl CoStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoStatus::Running => "running",
            CoStatus::Suspended => "suspended",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

/// Status of `co` as seen from the current thread.
pub fn status_of(rt: &Runtime, co: ThreadRef) -> CoStatus {
    if co == rt.current {
        return CoStatus::Running;
    }
    let th = rt.heap.thread(co);
    match th.status {
        Status::Yield => CoStatus::Suspended,
        Status::Ok => {
            if th.ci.len() > 1 {
                CoStatus::Normal // it called back into something
            } else if th.top > 1 {
                CoStatus::Suspended // not yet started (function pushed)
            } else {
                CoStatus::Dead
            }
        }
        _ => CoStatus::Dead, // stopped by an error
    }
}

/// True when the current position may yield.
pub fn is_yieldable(rt: &Runtime) -> bool {
    rt.th().nny == 0
}

/// Suspend the current coroutine, leaving `nresults` values on top for
/// the resumer. Returns the control object the caller must propagate
/// with `Err`. Native callers that want to continue after resumption
/// pass a continuation.
pub fn do_yield(
    rt: &mut Runtime,
    nresults: usize,
    k: Option<NativeK>,
    ctx: i64,
) -> Control {
    if rt.th().nny > 0 {
        let msg = if rt.current != rt.main_thread {
            "attempt to yield across a C-call boundary"
        } else {
            "attempt to yield from outside a coroutine"
        };
        return ldebug::run_error(rt, msg.into());
    }
    rt.th_mut().status = Status::Yield;
    rt.th_mut().n_yielded = nresults;
    let frame = rt.th_mut().frame_mut();
    match &mut frame.kind {
        FrameKind::Lua { .. } => {
            // Yield from a hook: no continuation is possible, the
            // instruction will simply be re-dispatched.
            debug_assert!(k.is_none(), "hooks cannot continue after yielding");
        }
        FrameKind::Native { k: slot_k, ctx: slot_ctx, .. } => {
            *slot_k = k;
            *slot_ctx = ctx;
        }
        FrameKind::Base => {}
    }
    Control::Yield
}

fn resume_error(rt: &mut Runtime, co: ThreadRef, msg: &str, nargs: usize) -> Status {
    let value = rt.new_string_value(msg);
    let th = rt.heap.thread_mut(co);
    th.top -= nargs; // drop the would-be arguments
    let top = th.top;
    th.stack[top] = value;
    th.top = top + 1;
    Status::ErrRun
}

/// Resume `co` with `nargs` arguments already on its stack. On return,
/// the yield/return values (or the error object) sit on `co`'s stack
/// top. The status reports how the coroutine stopped.
pub fn resume(rt: &mut Runtime, co: ThreadRef, nargs: usize) -> Status {
    let prev = rt.current;
    let co_status = status_of(rt, co);
    match co_status {
        CoStatus::Suspended => {}
        CoStatus::Dead => return resume_error(rt, co, "cannot resume dead coroutine", nargs),
        _ => return resume_error(rt, co, "cannot resume non-suspended coroutine", nargs),
    }
    // Chain reentrancy depth from the resuming thread.
    let from_calls = rt.heap.thread(prev).n_ccalls;
    if from_calls + 1 >= MAX_NATIVE_CALLS {
        return resume_error(rt, co, "C stack overflow", nargs);
    }
    rt.heap.thread_mut(co).n_ccalls = from_calls + 1;

    rt.current = co;
    let old_nny = rt.th().nny;
    rt.th_mut().nny = 0;

    let mut outcome = run_resumed(rt, nargs);
    // Errors inside yieldable protected calls are recoverable: unwind
    // to the YPCALL frame and keep running through its continuation.
    loop {
        match outcome {
            Err(Control::Error(e)) if e.status.is_error() => {
                if !recover(rt, e.status, e.value) {
                    break;
                }
                outcome = unroll(rt, Some(e.status));
            }
            _ => break,
        }
    }

    let status = match outcome {
        Ok(()) => Status::Ok,
        Err(Control::Yield) => Status::Yield,
        Err(Control::Error(e)) => {
            // Unrecoverable: the coroutine dies with the error object
            // on top.
            let errobj = call::error_object(rt, e.status, e.value);
            let th = rt.th_mut();
            th.status = e.status;
            let top = th.top;
            th.stack[top] = errobj;
            th.top = top + 1;
            let ci_top = th.top;
            th.frame_mut().top = ci_top;
            e.status
        }
    };
    if status == Status::Ok {
        rt.th_mut().status = Status::Ok;
    }
    rt.th_mut().nny = old_nny;
    rt.heap.thread_mut(co).n_ccalls = from_calls;
    rt.current = prev;
    status
}

/// The body of a resume: start the coroutine, or pick up where the
/// yield left it.
fn run_resumed(rt: &mut Runtime, nargs: usize) -> RtResult<()> {
    if rt.th().status == Status::Ok {
        // First resume: the function sits under the arguments.
        let func = rt.th().top - nargs - 1;
        match call::precall(rt, func, MULTRET)? {
            call::PreCall::Native => Ok(()),
            call::PreCall::Lua => vm::execute(rt),
        }
    } else {
        debug_assert_eq!(rt.th().status, Status::Yield);
        rt.th_mut().status = Status::Ok;
        if rt.th().frame().is_lua() {
            // Yield happened in a hook: just continue the interpreter.
            vm::execute(rt)?;
        } else {
            finish_native_frame(rt, Status::Yield, Some(nargs))?;
        }
        unroll(rt, None)
    }
}

/// Complete the native frame on top: run its continuation (or adopt
/// the resume arguments as results) and finish the original call.
fn finish_native_frame(
    rt: &mut Runtime,
    status: Status,
    resume_args: Option<usize>,
) -> RtResult<()> {
    let (k, ctx, ypcall, old_errfunc) = {
        let frame = rt.th().frame();
        match frame.kind {
            FrameKind::Native { k, ctx, old_errfunc } => {
                (k, ctx, frame.flags.contains(CallFlags::YPCALL), old_errfunc)
            }
            _ => unreachable!("native frame expected"),
        }
    };
    if ypcall {
        // The continuation runs inside the same protection.
        rt.th_mut().frame_mut().flags &= !CallFlags::YPCALL;
        rt.th_mut().errfunc = old_errfunc;
    }
    let n = match k {
        Some(k) => k(rt, status, ctx)? as usize,
        None => resume_args.expect("frames without continuations only suspend at yield"),
    };
    let first = rt.th().top - n;
    call::poscall(rt, first, n)
}

/// Run every suspended frame to completion, innermost first.
fn unroll(rt: &mut Runtime, first_status: Option<Status>) -> RtResult<()> {
    if let Some(status) = first_status {
        finish_native_frame(rt, status, None)?;
    }
    while rt.th().ci.len() > 1 {
        if rt.th().frame().is_lua() {
            vm::finish_op(rt)?;
            vm::execute(rt)?;
        } else {
            finish_native_frame(rt, Status::Yield, None)?;
        }
    }
    Ok(())
}

/// Number of values the finished resume left on `co`'s top.
pub fn result_count(rt: &Runtime, co: ThreadRef, status: Status) -> usize {
    let th = rt.heap.thread(co);
    match status {
        Status::Yield => th.n_yielded,
        Status::Ok => th.top.saturating_sub(1), // results sit above the base slot
        _ => 1, // the error object
    }
}

/// Unwind to the innermost yieldable protected call, if any, restoring
/// its saved state and depositing the error object.
fn recover(rt: &mut Runtime, status: Status, value: Value) -> bool {
    let Some(idx) = rt
        .th()
        .ci
        .iter()
        .rposition(|ci| ci.flags.contains(CallFlags::YPCALL))
    else {
        return false;
    };
    let (old_top, old_errfunc, oah) = {
        let frame = &rt.th().ci[idx];
        let old_errfunc = match frame.kind {
            FrameKind::Native { old_errfunc, .. } => old_errfunc,
            _ => unreachable!("yieldable pcalls are native frames"),
        };
        (frame.extra, old_errfunc, frame.flags.contains(CallFlags::OAH))
    };
    let cur = rt.current;
    close_upvalues(rt, cur, old_top);
    let errobj = call::error_object(rt, status, value);
    let th = rt.th_mut();
    th.ci.truncate(idx + 1);
    th.stack[old_top] = errobj;
    for v in &mut th.stack[old_top + 1..] {
        *v = Value::Nil;
    }
    th.top = old_top + 1;
    th.allow_hook = oah;
    th.nny = 0;
    th.errfunc = old_errfunc;
    rt.shrink_stack();
    true
}
