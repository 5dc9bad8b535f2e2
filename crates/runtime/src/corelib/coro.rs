//! The `coroutine` table.

use crate::api::upvalue_index;
use crate::error::{RtResult, Status};
use crate::heap::ThreadRef;
use crate::ldebug;
use crate::state::Runtime;
use crate::value::{Type, Value};

pub fn open(rt: &mut Runtime) -> RtResult<()> {
    rt.create_table(0, 7)?;
    let entries: &[(&str, crate::value::NativeFn)] = &[
        ("create", co_create),
        ("resume", co_resume),
        ("yield", co_yield),
        ("status", co_status),
        ("wrap", co_wrap),
        ("isyieldable", co_isyieldable),
        ("running", co_running),
    ];
    for (name, f) in entries {
        rt.push_native(*f)?;
        rt.set_field(-2, name)?;
    }
    rt.set_global_field("coroutine")?;
    Ok(())
}

fn check_coroutine(rt: &mut Runtime, idx: i32) -> RtResult<ThreadRef> {
    rt.to_thread(idx).ok_or_else(|| {
        ldebug::run_error(rt, format!("bad argument #{idx} (coroutine expected)"))
    })
}

fn co_create(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1).type_of(), Type::Function) {
        return Err(ldebug::run_error(rt, "bad argument #1 (function expected)".into()));
    }
    let co = rt.new_thread_api()?; // thread on top
    rt.push_index(1)?; // the body function
    rt.xmove(co, 1); // seed the coroutine's stack with it
    Ok(1)
}

/// Shared resume plumbing: returns the result count already on the
/// caller's stack, or an error message (also on the stack).
fn aux_resume(rt: &mut Runtime, co: ThreadRef, nargs: usize) -> RtResult<Result<usize, ()>> {
    let (status, nres) = rt.resume(co, nargs);
    match status {
        Status::Ok | Status::Yield => Ok(Ok(nres)),
        _ => Ok(Err(())), // error object is on top
    }
}

fn co_resume(rt: &mut Runtime) -> RtResult<u32> {
    let co = check_coroutine(rt, 1)?;
    let nargs = rt.get_top() - 1;
    match aux_resume(rt, co, nargs)? {
        Ok(nres) => {
            rt.push_bool(true)?;
            rt.insert(-(nres as i32) - 1);
            Ok(nres as u32 + 1)
        }
        Err(()) => {
            rt.push_bool(false)?;
            rt.insert(-2); // false below the error message
            Ok(2)
        }
    }
}

fn co_yield(rt: &mut Runtime) -> RtResult<u32> {
    let n = rt.get_top();
    Err(rt.yield_k(n, 0, None))
}

fn co_status(rt: &mut Runtime) -> RtResult<u32> {
    let co = check_coroutine(rt, 1)?;
    let status = rt.co_status(co);
    rt.push_str(status.name())?;
    Ok(1)
}

fn wrap_call(rt: &mut Runtime) -> RtResult<u32> {
    let co = match rt.value_at(upvalue_index(1)) {
        Value::Thread(t) => t,
        _ => unreachable!("wrap closures carry their coroutine"),
    };
    let nargs = rt.get_top();
    match aux_resume(rt, co, nargs)? {
        Ok(nres) => Ok(nres as u32),
        Err(()) => {
            // Re-raise the error in the caller.
            let v = rt.value_at(-1);
            rt.pop(1);
            Err(crate::call::error_msg(rt, v))
        }
    }
}

fn co_wrap(rt: &mut Runtime) -> RtResult<u32> {
    co_create(rt)?; // coroutine on top
    rt.push_native_closure(wrap_call, 1)?;
    Ok(1)
}

fn co_isyieldable(rt: &mut Runtime) -> RtResult<u32> {
    let y = rt.is_yieldable();
    rt.push_bool(y)?;
    Ok(1)
}

fn co_running(rt: &mut Runtime) -> RtResult<u32> {
    let is_main = rt.push_thread()?;
    rt.push_bool(is_main)?;
    Ok(2)
}
