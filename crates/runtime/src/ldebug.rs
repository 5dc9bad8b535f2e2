//! Debug introspection and error reporting.
//!
//! Runtime errors are prefixed with `source:line:` from the innermost
//! script frame. Function names in tracebacks are recovered by symbolic
//! execution over the calling function's bytecode: starting at the call
//! site, walk backwards to the instruction that produced the callee and
//! name it after the global, field, method, upvalue, or local it came
//! from.

use selune_core::opcode::{Instruction, OpCode, index_k, is_k};
use selune_core::proto::chunk_id;

use crate::call;
use crate::error::{Control, RtResult};
use crate::func::Proto;
use crate::heap::ProtoRef;
use crate::meta::Tm;
use crate::state::{CallFlags, CallInfo, FrameKind, HookEvent, MASK_COUNT, MASK_LINE, Runtime};
use crate::value::Value;

// ======================================================================
// Positions
// ======================================================================

/// Proto of the closure running in `frame`, if it is a script frame.
fn frame_proto(rt: &Runtime, frame: &CallInfo) -> Option<ProtoRef> {
    if !frame.is_lua() {
        return None;
    }
    let func = rt.th().stack[frame.func];
    match func {
        Value::Closure(c) => Some(rt.heap.closure(c).proto),
        _ => None,
    }
}

/// Index of the currently executing instruction in a script frame.
pub fn current_pc(frame: &CallInfo) -> usize {
    match frame.kind {
        // `pc` is the next instruction to run.
        FrameKind::Lua { pc, .. } => pc.saturating_sub(1),
        _ => 0,
    }
}

/// `source:line` of the innermost script frame, if any.
pub fn current_location(rt: &Runtime) -> Option<(String, u32)> {
    for frame in rt.th().ci.iter().rev() {
        if let Some(pref) = frame_proto(rt, frame) {
            let p = rt.heap.proto(pref);
            let line = p.line_at(current_pc(frame));
            let src = proto_source(rt, p);
            return Some((src, line));
        }
    }
    None
}

pub fn proto_source(rt: &Runtime, p: &Proto) -> String {
    match p.source {
        Some(s) => chunk_id(rt.str_bytes(s)),
        None => "?".into(),
    }
}

/// Prefix `msg` with the current source position.
pub fn where_prefix(rt: &Runtime, msg: &str) -> String {
    match current_location(rt) {
        Some((src, line)) => format!("{src}:{line}: {msg}"),
        None => msg.to_string(),
    }
}

// ======================================================================
// Error constructors
// ======================================================================

/// Raise a runtime error with a located message, filtered through the
/// active message handler.
pub fn run_error(rt: &mut Runtime, msg: String) -> Control {
    let located = where_prefix(rt, &msg);
    tracing::debug!(target: "selune::error", error = %located, "runtime error");
    let value = rt.new_string_value(&located);
    call::error_msg(rt, value)
}

/// "attempt to <op> a <type> value".
pub fn type_error(rt: &mut Runtime, v: &Value, op: &str) -> Control {
    run_error(rt, format!("attempt to {op} a {} value", v.type_name()))
}

pub fn index_error(rt: &mut Runtime, t: &Value, _key: &Value) -> Control {
    type_error(rt, t, "index")
}

pub fn op_error(rt: &mut Runtime, v: &Value, op: &str) -> Control {
    if matches!(v, Value::Str(_)) && op == "perform arithmetic on" {
        // A string that survived the coercion attempt but failed it.
        return run_error(rt, format!("attempt to {op} a string value"));
    }
    type_error(rt, v, op)
}

pub fn to_int_error(rt: &mut Runtime, _v: &Value) -> Control {
    run_error(rt, "number has no integer representation".into())
}

pub fn order_error(rt: &mut Runtime, a: &Value, b: &Value) -> Control {
    let ta = a.type_name();
    let tb = b.type_name();
    if ta == tb {
        run_error(rt, format!("attempt to compare two {ta} values"))
    } else {
        run_error(rt, format!("attempt to compare {ta} with {tb}"))
    }
}

// ======================================================================
// Hooks
// ======================================================================

/// Fire the installed hook for `event`. Hooks are non-reentrant; one
/// running hook masks all others.
pub fn call_hook(rt: &mut Runtime, event: HookEvent) -> RtResult<()> {
    let (hook, allowed) = {
        let th = rt.th();
        (th.hook, th.allow_hook)
    };
    let Some(hook) = hook else { return Ok(()) };
    if !allowed {
        return Ok(());
    }
    let line = current_location(rt).map(|(_, l)| l).unwrap_or(0);
    let saved_top = rt.th().top;
    rt.th_mut().allow_hook = false;
    let r = hook(rt, event, line);
    rt.th_mut().allow_hook = true;
    if r.is_ok() {
        rt.th_mut().top = saved_top;
    }
    r
}

/// Per-instruction bookkeeping for line and count hooks. Called by the
/// dispatch loop before each instruction.
pub fn trace_execution(rt: &mut Runtime, pc: usize) -> RtResult<()> {
    let mask = rt.th().hook_mask;
    let mut count_hit = false;
    if mask & MASK_COUNT != 0 {
        let th = rt.th_mut();
        if th.hook_count > 0 {
            th.hook_count -= 1;
        }
        if th.hook_count == 0 {
            th.hook_count = th.base_hook_count;
            count_hit = true;
        }
    }
    if rt.th().frame().flags.contains(CallFlags::HOOKYIELD) {
        // This instruction's hooks already ran before the yield.
        rt.th_mut().frame_mut().flags &= !CallFlags::HOOKYIELD;
        return Ok(());
    }
    if count_hit {
        hook_with_yield_mark(rt, HookEvent::Count, pc)?;
    }
    if mask & MASK_LINE != 0 {
        hook_with_yield_mark(rt, HookEvent::Line, pc)?;
    }
    Ok(())
}

/// Run a hook; if it yields, arrange for the instruction to be
/// re-dispatched on resume without re-firing its hooks.
fn hook_with_yield_mark(rt: &mut Runtime, event: HookEvent, pc: usize) -> RtResult<()> {
    match call_hook(rt, event) {
        Err(Control::Yield) => {
            let frame = rt.th_mut().frame_mut();
            frame.flags |= CallFlags::HOOKYIELD;
            if let FrameKind::Lua { pc: saved, .. } = &mut frame.kind {
                *saved = pc; // re-execute the hooked instruction
            }
            Err(Control::Yield)
        }
        other => other,
    }
}

// ======================================================================
// Symbolic execution: name recovery
// ======================================================================

/// What a recovered name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Local,
    Global,
    Field,
    Method,
    Upvalue,
    Constant,
    Metamethod,
    ForIterator,
}

impl NameKind {
    pub fn describe(self) -> &'static str {
        match self {
            NameKind::Local => "local",
            NameKind::Global => "global",
            NameKind::Field => "field",
            NameKind::Method => "method",
            NameKind::Upvalue => "upvalue",
            NameKind::Constant => "constant",
            NameKind::Metamethod => "metamethod",
            NameKind::ForIterator => "for iterator",
        }
    }
}

fn filter_pc(pc: i32, jump_target: i32) -> i32 {
    if pc < jump_target { -1 } else { pc }
}

/// Last unconditional instruction before `last_pc` that wrote `reg`.
fn find_set_reg(p: &Proto, last_pc: usize, reg: u32) -> i32 {
    let mut set_reg: i32 = -1;
    let mut jump_target: i32 = 0;
    for pc in 0..last_pc {
        let i = p.code[pc];
        let op = i.opcode();
        let a = i.a();
        match op {
            OpCode::LoadNil => {
                let b = i.b();
                if a <= reg && reg <= a + b {
                    set_reg = filter_pc(pc as i32, jump_target);
                }
            }
            OpCode::TForCall => {
                if reg >= a + 2 {
                    set_reg = filter_pc(pc as i32, jump_target);
                }
            }
            OpCode::Call | OpCode::TailCall => {
                if reg >= a {
                    set_reg = filter_pc(pc as i32, jump_target);
                }
            }
            OpCode::Jmp => {
                let dest = pc as i32 + 1 + i.sbx();
                if (pc as i32) < dest && dest <= last_pc as i32 && dest > jump_target {
                    jump_target = dest;
                }
            }
            _ => {
                if op.sets_a() && reg == a {
                    set_reg = filter_pc(pc as i32, jump_target);
                }
            }
        }
    }
    set_reg
}

fn constant_str(rt: &Runtime, p: &Proto, k: usize) -> Option<String> {
    match p.constants.get(k) {
        Some(Value::Str(s)) => {
            Some(String::from_utf8_lossy(rt.str_bytes(*s)).into_owned())
        }
        _ => None,
    }
}

fn upvalue_name(rt: &Runtime, p: &Proto, idx: usize) -> String {
    p.upvalue_names
        .get(idx)
        .and_then(|n| *n)
        .map(|s| String::from_utf8_lossy(rt.str_bytes(s)).into_owned())
        .unwrap_or_else(|| "?".into())
}

/// Name of the RK operand `c` used as a key.
fn key_name(rt: &Runtime, p: &Proto, pc: usize, c: u32) -> String {
    if is_k(c) {
        if let Some(s) = constant_str(rt, p, index_k(c) as usize) {
            return s;
        }
    } else if let Some((NameKind::Constant, name)) = get_obj_name(rt, p, pc, c) {
        return name;
    }
    "?".into()
}

/// Recover the name of whatever occupies register `reg` at `last_pc`.
pub fn get_obj_name(
    rt: &Runtime,
    p: &Proto,
    last_pc: usize,
    reg: u32,
) -> Option<(NameKind, String)> {
    if let Some(name) = p.local_name(reg + 1, last_pc as u32) {
        return Some((
            NameKind::Local,
            String::from_utf8_lossy(rt.str_bytes(name)).into_owned(),
        ));
    }
    let pc = find_set_reg(p, last_pc, reg);
    if pc < 0 {
        return None;
    }
    let pc = pc as usize;
    let i = p.code[pc];
    match i.opcode() {
        OpCode::Move => {
            let b = i.b();
            if b < i.a() {
                return get_obj_name(rt, p, pc, b);
            }
            None
        }
        OpCode::GetTabUp | OpCode::GetTable => {
            let key = key_name(rt, p, pc, i.c());
            let table_name = if i.opcode() == OpCode::GetTable {
                p.local_name(i.b() + 1, pc as u32)
                    .map(|s| String::from_utf8_lossy(rt.str_bytes(s)).into_owned())
            } else {
                Some(upvalue_name(rt, p, i.b() as usize))
            };
            let kind = if table_name.as_deref() == Some("_ENV") {
                NameKind::Global
            } else {
                NameKind::Field
            };
            Some((kind, key))
        }
        OpCode::GetUpval => Some((NameKind::Upvalue, upvalue_name(rt, p, i.b() as usize))),
        OpCode::LoadK | OpCode::LoadKX => {
            let k = if i.opcode() == OpCode::LoadK {
                i.bx() as usize
            } else {
                p.code[pc + 1].ax_arg() as usize
            };
            constant_str(rt, p, k).map(|s| (NameKind::Constant, s))
        }
        OpCode::SelfOp => Some((NameKind::Method, key_name(rt, p, pc, i.c()))),
        _ => None,
    }
}

/// Name of the function being called by frame `ci_idx`, recovered from
/// its caller's call site.
pub fn function_name(rt: &Runtime, ci_idx: usize) -> Option<(NameKind, String)> {
    if ci_idx == 0 {
        return None;
    }
    let frame = &rt.th().ci[ci_idx];
    if frame.flags.contains(CallFlags::TAIL) {
        return None; // the call site was overwritten
    }
    let caller = &rt.th().ci[ci_idx - 1];
    let pref = frame_proto(rt, caller)?;
    let p = rt.heap.proto(pref);
    let pc = current_pc(caller);
    let i: Instruction = *p.code.get(pc)?;
    match i.opcode() {
        OpCode::Call | OpCode::TailCall => get_obj_name(rt, p, pc, i.a()),
        OpCode::TForCall => Some((NameKind::ForIterator, "for iterator".into())),
        OpCode::SelfOp | OpCode::GetTabUp | OpCode::GetTable => {
            Some((NameKind::Metamethod, Tm::Index.name().trim_start_matches("__").into()))
        }
        OpCode::SetTabUp | OpCode::SetTable => {
            Some((NameKind::Metamethod, Tm::NewIndex.name().trim_start_matches("__").into()))
        }
        OpCode::Eq => Some((NameKind::Metamethod, "eq".into())),
        OpCode::Lt => Some((NameKind::Metamethod, "lt".into())),
        OpCode::Le => Some((NameKind::Metamethod, "le".into())),
        OpCode::Concat => Some((NameKind::Metamethod, "concat".into())),
        OpCode::Len => Some((NameKind::Metamethod, "len".into())),
        op if (OpCode::Add as u8..=OpCode::Shr as u8).contains(&(op as u8)) => {
            Some((NameKind::Metamethod, "arith".into()))
        }
        _ => None,
    }
}

// ======================================================================
// Frame information
// ======================================================================

/// A `getinfo` result.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub name: Option<String>,
    pub name_what: &'static str,
    /// "main", "Lua", "C", or "tail"
    pub what: &'static str,
    pub source: String,
    pub short_src: String,
    pub current_line: u32,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_upvalues: u32,
    pub num_params: u32,
    pub is_vararg: bool,
    pub is_tail_call: bool,
}

/// Frame index for `level` (0 = running function), if the stack is
/// that deep. The base sentinel does not count as a level.
pub fn get_stack(rt: &Runtime, level: usize) -> Option<usize> {
    let depth = rt.th().ci.len();
    if level + 2 > depth {
        return None;
    }
    Some(depth - 1 - level)
}

pub fn get_info(rt: &Runtime, ci_idx: usize) -> DebugInfo {
    let frame = &rt.th().ci[ci_idx];
    let mut info = DebugInfo {
        is_tail_call: frame.flags.contains(CallFlags::TAIL),
        ..DebugInfo::default()
    };
    match frame_proto(rt, frame) {
        Some(pref) => {
            let p = rt.heap.proto(pref);
            info.source = p
                .source
                .map(|s| String::from_utf8_lossy(rt.str_bytes(s)).into_owned())
                .unwrap_or_else(|| "=?".into());
            info.short_src = proto_source(rt, p);
            info.line_defined = p.line_defined;
            info.last_line_defined = p.last_line_defined;
            info.what = if p.line_defined == 0 { "main" } else { "Lua" };
            info.current_line = p.line_at(current_pc(frame));
            info.num_upvalues = p.upvalues.len() as u32;
            info.num_params = p.num_params as u32;
            info.is_vararg = p.is_vararg;
        }
        None => {
            info.source = "=[C]".into();
            info.short_src = "[C]".into();
            info.what = "C";
            let func = rt.th().stack[frame.func];
            if let Value::NativeClosure(c) = func {
                info.num_upvalues = rt.heap.native_closure(c).upvals.len() as u32;
            }
        }
    }
    if let Some((kind, name)) = function_name(rt, ci_idx) {
        info.name_what = kind.describe();
        info.name = Some(name);
    }
    info
}

/// Build a standard traceback string starting at `level`.
pub fn traceback(rt: &Runtime, msg: Option<&str>, level: usize) -> String {
    let mut out = String::new();
    if let Some(m) = msg {
        out.push_str(m);
        out.push('\n');
    }
    out.push_str("stack traceback:");
    let depth = rt.th().ci.len();
    let mut level = level;
    loop {
        let Some(idx) = get_stack(rt, level) else { break };
        let info = get_info(rt, idx);
        out.push_str("\n\t");
        out.push_str(&info.short_src);
        if info.current_line > 0 {
            out.push_str(&format!(":{}:", info.current_line));
        } else {
            out.push(':');
        }
        match (&info.name, info.what) {
            (_, "main") => out.push_str(" in main chunk"),
            (Some(name), _) => out.push_str(&format!(" in function '{name}'")),
            (None, "C") => out.push_str(" in ?"),
            (None, _) => out.push_str(&format!(
                " in function <{}:{}>",
                info.short_src, info.line_defined
            )),
        }
        if info.is_tail_call {
            out.push_str("\n\t(...tail calls...)");
        }
        level += 1;
        if level > depth + 10 {
            break;
        }
    }
    out
}
