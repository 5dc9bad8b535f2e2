//! The bytecode dispatch loop.
//!
//! One `execute` invocation runs the innermost script frame and every
//! script frame it calls, without Rust-stack recursion: a script-to-
//! script call pushes a frame and restarts the loop; RETURN on a frame
//! flagged FRESH leaves the loop back to native code. Tail calls reuse
//! the caller's frame slot. Test instructions are fused with the JMP
//! that must follow them.
//!
//! The loop writes the advanced pc into the frame before dispatching,
//! so error reporting, hooks, and mid-instruction yields always see a
//! consistent position; `finish_op` completes an instruction whose
//! metamethod call yielded.

use selune_core::opcode::{FIELDS_PER_FLUSH, Instruction, OpCode, fb_to_int, index_k, is_k};

use crate::call::{self, PreCall, close_upvalues};
use crate::error::RtResult;
use crate::func::{LClosure, upval_get, upval_set};
use crate::gc;
use crate::heap::ProtoRef;
use crate::ldebug;
use crate::meta::Tm;
use crate::ops;
use crate::state::{CallFlags, FrameKind, MASK_COUNT, MASK_LINE, Runtime};
use crate::value::Value;

#[inline]
fn arith_event(op: OpCode) -> Tm {
    match op {
        OpCode::Add => Tm::Add,
        OpCode::Sub => Tm::Sub,
        OpCode::Mul => Tm::Mul,
        OpCode::Mod => Tm::Mod,
        OpCode::Pow => Tm::Pow,
        OpCode::Div => Tm::Div,
        OpCode::IDiv => Tm::IDiv,
        OpCode::BAnd => Tm::BAnd,
        OpCode::BOr => Tm::BOr,
        OpCode::BXor => Tm::BXor,
        OpCode::Shl => Tm::Shl,
        OpCode::Shr => Tm::Shr,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

#[inline]
fn set_frame_pc(rt: &mut Runtime, pc: usize) {
    if let FrameKind::Lua { pc: saved, .. } = &mut rt.th_mut().frame_mut().kind {
        *saved = pc;
    }
}

/// Read register or constant for an RK operand.
#[inline]
fn rk(rt: &Runtime, proto: ProtoRef, base: usize, x: u32) -> Value {
    if is_k(x) {
        rt.heap.proto(proto).constants[index_k(x) as usize]
    } else {
        rt.th().stack[base + x as usize]
    }
}

#[inline]
fn reg(rt: &Runtime, base: usize, r: u32) -> Value {
    rt.th().stack[base + r as usize]
}

#[inline]
fn set_reg(rt: &mut Runtime, base: usize, r: u32, v: Value) {
    rt.th_mut().stack[base + r as usize] = v;
}

/// Execute the JMP at `pc` (the pair of a preceding test).
fn do_jump(rt: &mut Runtime, i: Instruction, base: usize, pc: &mut usize) {
    let a = i.a();
    if a != 0 {
        let cur = rt.current;
        close_upvalues(rt, cur, base + a as usize - 1);
    }
    *pc = (*pc as i64 + i.sbx() as i64) as usize;
}

fn do_next_jump(rt: &mut Runtime, proto: ProtoRef, base: usize, pc: &mut usize) {
    let i = rt.heap.proto(proto).code[*pc];
    debug_assert_eq!(i.opcode(), OpCode::Jmp);
    *pc += 1;
    do_jump(rt, i, base, pc);
}

/// Run script frames until the innermost FRESH frame returns.
pub fn execute(rt: &mut Runtime) -> RtResult<()> {
    // This invocation owns the entry frame: its RETURN leaves the loop.
    rt.th_mut().frame_mut().flags |= CallFlags::FRESH;
    'newframe: loop {
        let frame = rt.th().frame().clone();
        let (base, start_pc) = match frame.kind {
            FrameKind::Lua { base, pc } => (base, pc),
            _ => unreachable!("execute runs script frames"),
        };
        let frame_top = frame.top;
        let cl = match rt.th().stack[frame.func] {
            Value::Closure(c) => c,
            _ => unreachable!("script frame holds a script closure"),
        };
        let proto = rt.heap.closure(cl).proto;
        let mut pc = start_pc;

        loop {
            if rt.th().hook_mask & (MASK_LINE | MASK_COUNT) != 0 {
                set_frame_pc(rt, pc);
                ldebug::trace_execution(rt, pc)?;
            }
            let i = rt.heap.proto(proto).code[pc];
            pc += 1;
            set_frame_pc(rt, pc);
            let a = i.a();
            match i.opcode() {
                OpCode::Move => {
                    let v = reg(rt, base, i.b());
                    set_reg(rt, base, a, v);
                }
                OpCode::LoadK => {
                    let v = rt.heap.proto(proto).constants[i.bx() as usize];
                    set_reg(rt, base, a, v);
                }
                OpCode::LoadKX => {
                    let ax = rt.heap.proto(proto).code[pc].ax_arg();
                    pc += 1;
                    set_frame_pc(rt, pc);
                    let v = rt.heap.proto(proto).constants[ax as usize];
                    set_reg(rt, base, a, v);
                }
                OpCode::LoadBool => {
                    set_reg(rt, base, a, Value::Bool(i.b() != 0));
                    if i.c() != 0 {
                        pc += 1;
                        set_frame_pc(rt, pc);
                    }
                }
                OpCode::LoadNil => {
                    for r in a..=a + i.b() {
                        set_reg(rt, base, r, Value::Nil);
                    }
                }
                OpCode::GetUpval => {
                    let uv = rt.heap.closure(cl).upvals[i.b() as usize].clone();
                    let v = upval_get(&rt.heap, &uv);
                    set_reg(rt, base, a, v);
                }
                OpCode::GetTabUp => {
                    let uv = rt.heap.closure(cl).upvals[i.b() as usize].clone();
                    let t = upval_get(&rt.heap, &uv);
                    let key = rk(rt, proto, base, i.c());
                    ops::index_get(rt, t, key, base + a as usize)?;
                }
                OpCode::GetTable => {
                    let t = reg(rt, base, i.b());
                    let key = rk(rt, proto, base, i.c());
                    ops::index_get(rt, t, key, base + a as usize)?;
                }
                OpCode::SetTabUp => {
                    let uv = rt.heap.closure(cl).upvals[a as usize].clone();
                    let t = upval_get(&rt.heap, &uv);
                    let key = rk(rt, proto, base, i.b());
                    let v = rk(rt, proto, base, i.c());
                    ops::index_set(rt, t, key, v)?;
                }
                OpCode::SetUpval => {
                    let uv = rt.heap.closure(cl).upvals[i.b() as usize].clone();
                    let v = reg(rt, base, a);
                    upval_set(&mut rt.heap, &uv, v);
                    gc::barrier_upvalue(rt, &uv, &v);
                }
                OpCode::SetTable => {
                    let t = reg(rt, base, a);
                    let key = rk(rt, proto, base, i.b());
                    let v = rk(rt, proto, base, i.c());
                    ops::index_set(rt, t, key, v)?;
                }
                OpCode::NewTable => {
                    let narray = fb_to_int(i.b()) as usize;
                    let nhash = fb_to_int(i.c()) as usize;
                    let t = rt.new_table(narray, nhash);
                    set_reg(rt, base, a, Value::Table(t));
                }
                OpCode::SelfOp => {
                    let obj = reg(rt, base, i.b());
                    set_reg(rt, base, a + 1, obj);
                    let key = rk(rt, proto, base, i.c());
                    ops::index_get(rt, obj, key, base + a as usize)?;
                }
                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr) => {
                    let x = rk(rt, proto, base, i.b());
                    let y = rk(rt, proto, base, i.c());
                    ops::arith(rt, arith_event(op), x, y, base + a as usize)?;
                }
                OpCode::Unm => {
                    let x = reg(rt, base, i.b());
                    ops::arith(rt, Tm::Unm, x, x, base + a as usize)?;
                }
                OpCode::BNot => {
                    let x = reg(rt, base, i.b());
                    ops::arith(rt, Tm::BNot, x, x, base + a as usize)?;
                }
                OpCode::Not => {
                    let x = reg(rt, base, i.b());
                    set_reg(rt, base, a, Value::Bool(!x.truthy()));
                }
                OpCode::Len => {
                    let x = reg(rt, base, i.b());
                    ops::object_len(rt, x, base + a as usize)?;
                }
                OpCode::Concat => {
                    let b = i.b() as usize;
                    let c = i.c() as usize;
                    rt.th_mut().top = base + c + 1;
                    ops::concat_stack(rt, c - b + 1)?;
                    let v = rt.th().stack[base + b];
                    set_reg(rt, base, a, v);
                    rt.th_mut().top = frame_top;
                }
                OpCode::Jmp => {
                    do_jump(rt, i, base, &mut pc);
                    set_frame_pc(rt, pc);
                }
                OpCode::Eq => {
                    let x = rk(rt, proto, base, i.b());
                    let y = rk(rt, proto, base, i.c());
                    let eq = ops::equal_values(rt, x, y)?;
                    if eq != (a != 0) {
                        pc += 1;
                    } else {
                        do_next_jump(rt, proto, base, &mut pc);
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::Lt => {
                    let x = rk(rt, proto, base, i.b());
                    let y = rk(rt, proto, base, i.c());
                    let lt = ops::less_than(rt, x, y)?;
                    if lt != (a != 0) {
                        pc += 1;
                    } else {
                        do_next_jump(rt, proto, base, &mut pc);
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::Le => {
                    let x = rk(rt, proto, base, i.b());
                    let y = rk(rt, proto, base, i.c());
                    let le = ops::less_equal(rt, x, y)?;
                    if le != (a != 0) {
                        pc += 1;
                    } else {
                        do_next_jump(rt, proto, base, &mut pc);
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::Test => {
                    let v = reg(rt, base, a);
                    if v.truthy() != (i.c() != 0) {
                        pc += 1;
                    } else {
                        do_next_jump(rt, proto, base, &mut pc);
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::TestSet => {
                    let v = reg(rt, base, i.b());
                    if v.truthy() == (i.c() != 0) {
                        set_reg(rt, base, a, v);
                        do_next_jump(rt, proto, base, &mut pc);
                    } else {
                        pc += 1;
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::Call => {
                    let b = i.b();
                    let nresults = i.c() as i32 - 1;
                    let ra = base + a as usize;
                    if b != 0 {
                        rt.th_mut().top = ra + b as usize;
                    }
                    match call::precall(rt, ra, nresults)? {
                        PreCall::Native => {
                            if nresults >= 0 {
                                rt.th_mut().top = frame_top;
                            }
                        }
                        PreCall::Lua => continue 'newframe,
                    }
                }
                OpCode::TailCall => {
                    let b = i.b();
                    let ra = base + a as usize;
                    if b != 0 {
                        rt.th_mut().top = ra + b as usize;
                    }
                    match call::precall(rt, ra, selune_core::limits::MULTRET)? {
                        PreCall::Native => {
                            // Behaves as a plain call; the following
                            // RETURN ships the results.
                        }
                        PreCall::Lua => {
                            merge_tail_frames(rt)?;
                            continue 'newframe;
                        }
                    }
                }
                OpCode::Return => {
                    let b = i.b();
                    if !rt.heap.proto(proto).protos.is_empty() {
                        let cur = rt.current;
                        close_upvalues(rt, cur, base);
                    }
                    let ra = base + a as usize;
                    let nres = if b != 0 { b as usize - 1 } else { rt.th().top - ra };
                    let fresh = rt.th().frame().flags.contains(CallFlags::FRESH);
                    let wanted = rt.th().frame().nresults;
                    call::poscall(rt, ra, nres)?;
                    if fresh {
                        return Ok(());
                    }
                    // Reentry: continue the caller's loop.
                    if wanted != selune_core::limits::MULTRET {
                        let caller_top = rt.th().frame().top;
                        rt.th_mut().top = caller_top;
                    }
                    continue 'newframe;
                }
                OpCode::ForLoop => {
                    let ra = base + a as usize;
                    let (idx, limit, step) = {
                        let th = rt.th();
                        (th.stack[ra], th.stack[ra + 1], th.stack[ra + 2])
                    };
                    match (idx, limit, step) {
                        (Value::Int(idx), Value::Int(limit), Value::Int(step)) => {
                            // An overflowing increment means the index
                            // ran off the type's edge: the loop ends.
                            let (next, overflow) = idx.overflowing_add(step);
                            let continues = !overflow
                                && if step > 0 { next <= limit } else { limit <= next };
                            if continues {
                                pc = (pc as i64 + i.sbx() as i64) as usize;
                                let th = rt.th_mut();
                                th.stack[ra] = Value::Int(next);
                                th.stack[ra + 3] = Value::Int(next);
                            }
                        }
                        (Value::Float(idx), Value::Float(limit), Value::Float(step)) => {
                            let next = idx + step;
                            let continues =
                                if step > 0.0 { next <= limit } else { limit <= next };
                            if continues {
                                pc = (pc as i64 + i.sbx() as i64) as usize;
                                let th = rt.th_mut();
                                th.stack[ra] = Value::Float(next);
                                th.stack[ra + 3] = Value::Float(next);
                            }
                        }
                        _ => unreachable!("for-prep normalized control values"),
                    }
                    set_frame_pc(rt, pc);
                }
                OpCode::ForPrep => {
                    let ra = base + a as usize;
                    for_prep(rt, ra)?;
                    pc = (pc as i64 + i.sbx() as i64) as usize;
                    set_frame_pc(rt, pc);
                }
                OpCode::TForCall => {
                    let ra = base + a as usize;
                    let cb = ra + 3;
                    {
                        let th = rt.th_mut();
                        th.stack[cb + 2] = th.stack[ra + 2];
                        th.stack[cb + 1] = th.stack[ra + 1];
                        th.stack[cb] = th.stack[ra];
                        th.top = cb + 3;
                    }
                    call::call_value(rt, cb, i.c() as i32)?;
                    rt.th_mut().top = frame_top;
                    // Fused with the following TFORLOOP.
                    let loop_i = rt.heap.proto(proto).code[pc];
                    debug_assert_eq!(loop_i.opcode(), OpCode::TForLoop);
                    pc += 1;
                    tfor_loop(rt, base, loop_i, &mut pc);
                    set_frame_pc(rt, pc);
                }
                OpCode::TForLoop => {
                    tfor_loop(rt, base, i, &mut pc);
                    set_frame_pc(rt, pc);
                }
                OpCode::SetList => {
                    let mut n = i.b() as usize;
                    let mut c = i.c() as usize;
                    let ra = base + a as usize;
                    if n == 0 {
                        n = rt.th().top - ra - 1;
                    }
                    if c == 0 {
                        c = rt.heap.proto(proto).code[pc].ax_arg() as usize;
                        pc += 1;
                        set_frame_pc(rt, pc);
                    }
                    let t = match reg(rt, base, a) {
                        Value::Table(t) => t,
                        _ => unreachable!("SETLIST target is a table"),
                    };
                    let last = (c - 1) * FIELDS_PER_FLUSH as usize + n;
                    let seed = rt.strings.seed;
                    let mut tbl = rt.heap.take_table(t);
                    let before = tbl.array.len() + tbl.nodes.len();
                    if last > tbl.array.len() {
                        let nh = tbl.nodes.len();
                        tbl.resize(&mut rt.heap, seed, last, nh);
                    }
                    for j in (1..=n).rev() {
                        let v = rt.th().stack[ra + j];
                        tbl.set_int(
                            &mut rt.heap,
                            seed,
                            ((c - 1) * FIELDS_PER_FLUSH as usize + j) as i64,
                            v,
                        );
                    }
                    let after = tbl.array.len() + tbl.nodes.len();
                    rt.heap.put_table(t, tbl);
                    rt.heap.account(
                        (after as isize - before as isize)
                            * std::mem::size_of::<Value>() as isize,
                    );
                    gc::barrier_back(rt, t);
                    rt.th_mut().top = frame_top;
                }
                OpCode::Closure => {
                    let sub = rt.heap.proto(proto).protos[i.bx() as usize];
                    let ncl = push_closure(rt, sub, cl, base)?;
                    set_reg(rt, base, a, Value::Closure(ncl));
                }
                OpCode::VarArg => {
                    let b = i.b() as i32 - 1;
                    let ra = base + a as usize;
                    let num_params = rt.heap.proto(proto).num_params as usize;
                    let n = (base - frame.func - 1).saturating_sub(num_params);
                    let want = if b < 0 {
                        rt.ensure_stack(n)?;
                        rt.th_mut().top = ra + n;
                        n
                    } else {
                        b as usize
                    };
                    for j in 0..want {
                        let v = if j < n {
                            rt.th().stack[base - n + j]
                        } else {
                            Value::Nil
                        };
                        rt.th_mut().stack[ra + j] = v;
                    }
                }
                OpCode::ExtraArg => {
                    unreachable!("EXTRAARG is consumed by its predecessor");
                }
            }
        }
    }
}

/// FORPREP: normalize the three control values and pre-subtract the
/// step.
fn for_prep(rt: &mut Runtime, ra: usize) -> RtResult<()> {
    let (init, limit, step) = {
        let th = rt.th();
        (th.stack[ra], th.stack[ra + 1], th.stack[ra + 2])
    };
    if let (Value::Int(iv), Value::Int(sv)) = (init, step) {
        // Integer loop if the limit converts (clamping per direction).
        if let Some((ilim, stop_now)) = for_limit(rt, &limit, sv) {
            let th = rt.th_mut();
            th.stack[ra + 1] = Value::Int(ilim);
            let start = if stop_now { 0 } else { iv };
            th.stack[ra] = Value::Int(start.wrapping_sub(sv));
            return Ok(());
        }
    }
    // Float loop: everything must convert to number.
    let nlimit = ops::to_number(rt, &limit)
        .ok_or_else(|| ldebug::run_error(rt, "'for' limit must be a number".into()))?;
    let nstep = ops::to_number(rt, &step)
        .ok_or_else(|| ldebug::run_error(rt, "'for' step must be a number".into()))?;
    let ninit = ops::to_number(rt, &init)
        .ok_or_else(|| ldebug::run_error(rt, "'for' initial value must be a number".into()))?;
    let as_f = |n: selune_core::numeric::Number| match n {
        selune_core::numeric::Number::Int(i) => i as f64,
        selune_core::numeric::Number::Float(f) => f,
    };
    let th = rt.th_mut();
    th.stack[ra + 1] = Value::Float(as_f(nlimit));
    th.stack[ra + 2] = Value::Float(as_f(nstep));
    th.stack[ra] = Value::Float(as_f(ninit) - as_f(nstep));
    Ok(())
}

/// Convert a for-loop limit to an integer, clamping out-of-range
/// floats; the boolean reports a loop that can never run.
fn for_limit(rt: &Runtime, limit: &Value, step: i64) -> Option<(i64, bool)> {
    match limit {
        Value::Int(i) => Some((*i, false)),
        _ => {
            let n = ops::to_number(rt, limit)?;
            let f = match n {
                selune_core::numeric::Number::Int(i) => return Some((i, false)),
                selune_core::numeric::Number::Float(f) => f,
            };
            // Floor toward the loop: limit rounds down for ascending
            // loops, up for descending.
            let rounded = if step < 0 { f.ceil() } else { f.floor() };
            if let Some(i) = selune_core::numeric::float_to_int_exact(rounded) {
                Some((i, false))
            } else if f > 0.0 {
                Some((i64::MAX, step < 0))
            } else {
                Some((i64::MIN, step >= 0))
            }
        }
    }
}

fn tfor_loop(rt: &mut Runtime, base: usize, i: Instruction, pc: &mut usize) {
    let ra = base + i.a() as usize;
    let ctrl = rt.th().stack[ra + 1];
    if !ctrl.is_nil() {
        rt.th_mut().stack[ra] = ctrl;
        *pc = (*pc as i64 + i.sbx() as i64) as usize;
    }
}

/// CLOSURE: instantiate a nested prototype, capturing upvalues from
/// the running frame.
fn push_closure(
    rt: &mut Runtime,
    sub: ProtoRef,
    parent: crate::heap::ClosureRef,
    base: usize,
) -> RtResult<crate::heap::ClosureRef> {
    let descs = rt.heap.proto(sub).upvalues.clone();
    let mut upvals = Vec::with_capacity(descs.len());
    for d in descs {
        if d.in_stack {
            upvals.push(call::find_upvalue(rt, base + d.index as usize));
        } else {
            upvals.push(rt.heap.closure(parent).upvals[d.index as usize].clone());
        }
    }
    Ok(rt.new_lclosure(LClosure { proto: sub, upvals }))
}

/// Collapse the frame pushed by a tail call into its caller's slot.
fn merge_tail_frames(rt: &mut Runtime) -> RtResult<()> {
    let cur = rt.current;
    let new_frame = rt.th_mut().ci.pop().expect("tail-called frame");
    let old_frame = rt.th_mut().ci.pop().expect("caller frame");
    let (nbase, _npc) = match new_frame.kind {
        FrameKind::Lua { base, pc } => (base, pc),
        _ => unreachable!("only script callees reuse frames"),
    };
    let obase = match old_frame.kind {
        FrameKind::Lua { base, .. } => base,
        _ => unreachable!("tail calls happen in script frames"),
    };
    // Close upvalues of the caller before its registers are
    // overwritten.
    close_upvalues(rt, cur, obase);
    let nfunc = new_frame.func;
    let ofunc = old_frame.func;
    let shift = nfunc - ofunc;
    let new_top = {
        let th = rt.th_mut();
        let top = th.top;
        for i in 0..(top - nfunc) {
            th.stack[ofunc + i] = th.stack[nfunc + i];
        }
        th.top = top - shift;
        th.top
    };
    rt.th_mut().ci.push(crate::state::CallInfo {
        func: ofunc,
        top: new_top,
        nresults: old_frame.nresults,
        flags: old_frame.flags | CallFlags::TAIL,
        extra: 0,
        kind: FrameKind::Lua { base: nbase - shift, pc: 0 },
    });
    Ok(())
}

/// Complete an instruction whose metamethod call was interrupted by a
/// yield: the metamethod's result sits on top of the stack.
pub fn finish_op(rt: &mut Runtime) -> RtResult<()> {
    let frame = rt.th().frame().clone();
    let (base, pc) = match frame.kind {
        FrameKind::Lua { base, pc } => (base, pc),
        _ => unreachable!("finish_op acts on script frames"),
    };
    let cl = match rt.th().stack[frame.func] {
        Value::Closure(c) => c,
        _ => unreachable!("script frame holds a script closure"),
    };
    let proto = rt.heap.closure(cl).proto;
    if pc == 0 {
        return Ok(()); // frame never started an instruction
    }
    let inst = rt.heap.proto(proto).code[pc - 1];
    match inst.opcode() {
        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Div
        | OpCode::IDiv
        | OpCode::BAnd
        | OpCode::BOr
        | OpCode::BXor
        | OpCode::Shl
        | OpCode::Shr
        | OpCode::Unm
        | OpCode::BNot
        | OpCode::Len
        | OpCode::GetTabUp
        | OpCode::GetTable
        | OpCode::SelfOp => {
            let th = rt.th_mut();
            th.top -= 1;
            let v = th.stack[th.top];
            th.stack[base + inst.a() as usize] = v;
        }
        OpCode::Eq | OpCode::Lt | OpCode::Le => {
            let mut res = {
                let th = rt.th_mut();
                th.top -= 1;
                th.stack[th.top].truthy()
            };
            if rt.th().frame().flags.contains(CallFlags::LEQ) {
                debug_assert_eq!(inst.opcode(), OpCode::Le);
                rt.th_mut().frame_mut().flags &= !CallFlags::LEQ;
                res = !res;
            }
            debug_assert_eq!(rt.heap.proto(proto).code[pc].opcode(), OpCode::Jmp);
            if res != (inst.a() != 0) {
                // Condition failed: skip the jump.
                set_frame_pc(rt, pc + 1);
            } else {
                let jmp = rt.heap.proto(proto).code[pc];
                let mut new_pc = pc + 1;
                do_jump(rt, jmp, base, &mut new_pc);
                set_frame_pc(rt, new_pc);
            }
        }
        OpCode::Concat => {
            let top = rt.th().top - 1;
            let b = inst.b() as usize;
            let total = top - 1 - (base + b);
            {
                let th = rt.th_mut();
                let v = th.stack[top];
                th.stack[top - 2] = v;
            }
            if total > 1 {
                rt.th_mut().top = top - 1;
                ops::concat_stack(rt, total)?;
            }
            let v = rt.th().stack[rt.th().top - 1];
            let th = rt.th_mut();
            th.stack[base + inst.a() as usize] = v;
            th.top = frame.top;
        }
        OpCode::TForCall => {
            debug_assert_eq!(rt.heap.proto(proto).code[pc].opcode(), OpCode::TForLoop);
            rt.th_mut().top = frame.top;
        }
        OpCode::Call => {
            if inst.c() as i32 - 1 >= 0 {
                rt.th_mut().top = frame.top;
            }
        }
        OpCode::TailCall | OpCode::SetTabUp | OpCode::SetTable => {}
        _ => unreachable!("instruction cannot be interrupted"),
    }
    Ok(())
}
