//! Base library functions.

use selune_core::limits::MULTRET;
use selune_core::numeric::{self, Number};

use crate::api::GcOp;
use crate::call;
use crate::error::{Control, RtResult, Status};
use crate::ldebug;
use crate::meta::Tm;
use crate::state::Runtime;
use crate::value::{Type, Value};

pub fn open(rt: &mut Runtime) -> RtResult<()> {
    let entries: &[(&str, crate::value::NativeFn)] = &[
        ("assert", base_assert),
        ("collectgarbage", base_collectgarbage),
        ("error", base_error),
        ("getmetatable", base_getmetatable),
        ("ipairs", base_ipairs),
        ("load", base_load),
        ("next", base_next),
        ("pairs", base_pairs),
        ("pcall", base_pcall),
        ("print", base_print),
        ("rawequal", base_rawequal),
        ("rawget", base_rawget),
        ("rawlen", base_rawlen),
        ("rawset", base_rawset),
        ("select", base_select),
        ("setmetatable", base_setmetatable),
        ("tonumber", base_tonumber),
        ("tostring", base_tostring),
        ("type", base_type),
        ("xpcall", base_xpcall),
    ];
    for (name, f) in entries {
        rt.push_native(*f)?;
        rt.set_global_field(name)?;
    }
    // _G and _VERSION.
    let g = rt.globals;
    rt.push_value(Value::Table(g))?;
    rt.set_global_field("_G")?;
    rt.push_str("Selune 1.0")?;
    rt.set_global_field("_VERSION")?;
    // string.dump, the only string-library member in scope.
    rt.create_table(0, 1)?;
    rt.push_native(string_dump)?;
    rt.set_field(-2, "dump")?;
    rt.set_global_field("string")?;
    Ok(())
}

fn arg_error(rt: &mut Runtime, n: usize, msg: &str) -> Control {
    ldebug::run_error(rt, format!("bad argument #{n} ({msg})"))
}

fn check_any(rt: &mut Runtime, n: usize) -> RtResult<Value> {
    if rt.get_top() < n {
        return Err(arg_error(rt, n, "value expected"));
    }
    Ok(rt.value_at(n as i32))
}

/// `tostring` semantics with `__tostring` dispatch; leaves the result
/// on top.
pub fn tostring_value(rt: &mut Runtime, v: Value) -> RtResult<()> {
    let tm = rt.tm_by_value(&v, Tm::ToString);
    if !tm.is_nil() {
        rt.push_value(tm)?;
        rt.push_value(v)?;
        rt.call(1, 1)?;
        if !matches!(rt.value_at(-1), Value::Str(_)) {
            return Err(ldebug::run_error(rt, "'__tostring' must return a string".into()));
        }
        return Ok(());
    }
    let text = rt.display_value(&v);
    rt.push_str(&text)
}

fn base_print(rt: &mut Runtime) -> RtResult<u32> {
    let n = rt.get_top();
    let mut line = String::new();
    for i in 1..=n {
        let v = rt.value_at(i as i32);
        tostring_value(rt, v)?;
        let piece = rt.to_rust_string(-1).expect("tostring result");
        rt.pop(1);
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&piece);
    }
    println!("{line}");
    Ok(0)
}

fn base_type(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    rt.push_str(v.type_name())?;
    Ok(1)
}

fn base_tostring(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    tostring_value(rt, v)?;
    Ok(1)
}

fn base_tonumber(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    if rt.get_top() >= 2 {
        // With a base, the argument must be a string of digits.
        let base = rt
            .to_integer(2)
            .ok_or_else(|| arg_error(rt, 2, "number expected"))?;
        if !(2..=36).contains(&base) {
            return Err(arg_error(rt, 2, "base out of range"));
        }
        let Some(bytes) = rt.to_bytes(1) else {
            return Err(arg_error(rt, 1, "string expected"));
        };
        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim();
        let (neg, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        match i64::from_str_radix(digits, base as u32) {
            Ok(i) => rt.push_int(if neg { i.wrapping_neg() } else { i })?,
            Err(_) => rt.push_nil()?,
        }
        return Ok(1);
    }
    match v {
        Value::Int(_) | Value::Float(_) => rt.push_value(v)?,
        Value::Str(s) => {
            let bytes = rt.str_bytes(s).to_vec();
            match std::str::from_utf8(&bytes).ok().and_then(numeric::str_to_number) {
                Some(Number::Int(i)) => rt.push_int(i)?,
                Some(Number::Float(f)) => rt.push_float(f)?,
                None => rt.push_nil()?,
            }
        }
        _ => rt.push_nil()?,
    }
    Ok(1)
}

fn base_error(rt: &mut Runtime) -> RtResult<u32> {
    let level = if rt.get_top() >= 2 { rt.to_integer(2).unwrap_or(1) } else { 1 };
    let v = rt.value_at(1);
    let v = match (&v, level) {
        (Value::Str(s), l) if l > 0 => {
            // Prefix the position of the caller.
            let msg = String::from_utf8_lossy(rt.str_bytes(*s)).into_owned();
            let located = ldebug::where_prefix(rt, &msg);
            rt.new_string_value(&located)
        }
        _ => v,
    };
    Err(call::error_msg(rt, v))
}

fn base_assert(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    if v.truthy() {
        // Return all arguments.
        return Ok(rt.get_top() as u32);
    }
    if rt.get_top() >= 2 {
        let msg = rt.value_at(2);
        return Err(call::error_msg(rt, msg));
    }
    Err(ldebug::run_error(rt, "assertion failed!".into()))
}

fn finish_pcall(rt: &mut Runtime, status: Status, extra: i64) -> RtResult<u32> {
    if status.is_error() {
        rt.push_bool(false)?;
        rt.push_index(-2)?;
        Ok(2)
    } else {
        Ok((rt.get_top() as i64 - extra) as u32)
    }
}

fn pcall_cont(rt: &mut Runtime, status: Status, extra: i64) -> RtResult<u32> {
    finish_pcall(rt, status, extra)
}

fn base_pcall(rt: &mut Runtime) -> RtResult<u32> {
    check_any(rt, 1)?;
    rt.push_bool(true)?;
    rt.insert(1); // status slot below the function
    let nargs = rt.get_top() - 2;
    let status = rt.pcall_k(nargs, MULTRET, 0, 0, Some(pcall_cont))?;
    finish_pcall(rt, status, 0)
}

fn base_xpcall(rt: &mut Runtime) -> RtResult<u32> {
    let n = rt.get_top();
    if !matches!(rt.value_at(2).type_of(), Type::Function) {
        return Err(arg_error(rt, 2, "function expected"));
    }
    rt.push_bool(true)?;
    rt.push_index(1)?;
    rt.rotate(3, 2); // [msgh, true, f] -> [true, f, msgh-shifted args]
    let status = rt.pcall_k(n - 2, MULTRET, 2, 2, Some(pcall_cont))?;
    finish_pcall(rt, status, 2)
}

fn base_select(rt: &mut Runtime) -> RtResult<u32> {
    let n = rt.get_top() as i64;
    if let Value::Str(s) = rt.value_at(1) {
        if rt.str_bytes(s) == b"#" {
            rt.push_int(n - 1)?;
            return Ok(1);
        }
    }
    let i = rt
        .to_integer(1)
        .ok_or_else(|| arg_error(rt, 1, "number expected"))?;
    let i = if i < 0 { n + i } else { i };
    if i < 1 {
        return Err(arg_error(rt, 1, "index out of range"));
    }
    if i >= n {
        return Ok(0);
    }
    Ok((n - i) as u32)
}

fn base_next(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1), Value::Table(_)) {
        return Err(arg_error(rt, 1, "table expected"));
    }
    rt.set_top(2); // ensure the key slot exists
    if rt.next_entry(1)? { Ok(2) } else {
        rt.push_nil()?;
        Ok(1)
    }
}

fn base_pairs(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    let pairs_tm = {
        let mt = rt.metatable_of(&v);
        match mt {
            Some(mt) => {
                let key = rt.new_string(b"__pairs");
                rt.table_get_str(mt, key)
            }
            None => Value::Nil,
        }
    };
    if pairs_tm.is_nil() {
        rt.push_native(base_next)?;
        rt.push_index(1)?;
        rt.push_nil()?;
        Ok(3)
    } else {
        rt.push_value(pairs_tm)?;
        rt.push_index(1)?;
        rt.call(1, 3)?;
        Ok(3)
    }
}

fn ipairs_iter(rt: &mut Runtime) -> RtResult<u32> {
    let i = rt.to_integer(2).unwrap_or(0) + 1;
    rt.push_int(i)?;
    let ty = rt.get_index(1, i)?;
    if ty == Type::Nil { Ok(1) } else { Ok(2) }
}

fn base_ipairs(rt: &mut Runtime) -> RtResult<u32> {
    check_any(rt, 1)?;
    rt.push_native(ipairs_iter)?;
    rt.push_index(1)?;
    rt.push_int(0)?;
    Ok(3)
}

fn base_rawget(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1), Value::Table(_)) {
        return Err(arg_error(rt, 1, "table expected"));
    }
    rt.set_top(2);
    rt.raw_get(1)?;
    Ok(1)
}

fn base_rawset(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1), Value::Table(_)) {
        return Err(arg_error(rt, 1, "table expected"));
    }
    rt.set_top(3);
    rt.raw_set(1)?;
    Ok(1) // the table remains
}

fn base_rawequal(rt: &mut Runtime) -> RtResult<u32> {
    check_any(rt, 2)?;
    let eq = rt.raw_equal(1, 2);
    rt.push_bool(eq)?;
    Ok(1)
}

fn base_rawlen(rt: &mut Runtime) -> RtResult<u32> {
    match rt.value_at(1) {
        Value::Table(_) | Value::Str(_) => {
            let n = rt.raw_len(1);
            rt.push_int(n as i64)?;
            Ok(1)
        }
        _ => Err(arg_error(rt, 1, "table or string expected")),
    }
}

fn base_setmetatable(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1), Value::Table(_)) {
        return Err(arg_error(rt, 1, "table expected"));
    }
    if !matches!(rt.value_at(2), Value::Nil | Value::Table(_)) {
        return Err(arg_error(rt, 2, "nil or table expected"));
    }
    let v = rt.value_at(1);
    let mt_guard = {
        let mt = rt.metatable_of(&v);
        match mt {
            Some(mt) => {
                let key = rt.new_string(b"__metatable");
                !rt.table_get_str(mt, key).is_nil()
            }
            None => false,
        }
    };
    if mt_guard {
        return Err(ldebug::run_error(rt, "cannot change a protected metatable".into()));
    }
    rt.set_top(2);
    rt.set_metatable_api(1)?;
    Ok(1) // the table
}

fn base_getmetatable(rt: &mut Runtime) -> RtResult<u32> {
    let v = check_any(rt, 1)?;
    let Some(mt) = rt.metatable_of(&v) else {
        rt.push_nil()?;
        return Ok(1);
    };
    let guard = {
        let key = rt.new_string(b"__metatable");
        rt.table_get_str(mt, key)
    };
    if guard.is_nil() {
        rt.push_value(Value::Table(mt))?;
    } else {
        rt.push_value(guard)?;
    }
    Ok(1)
}

fn base_load(rt: &mut Runtime) -> RtResult<u32> {
    let chunk = rt.value_at(1);
    let chunk_name = if rt.get_top() >= 2 && !rt.is_nil(2) {
        rt.to_bytes(2).unwrap_or_else(|| b"=(load)".to_vec())
    } else {
        match chunk {
            Value::Str(_) => rt.to_bytes(1).expect("string chunk"),
            _ => b"=(load)".to_vec(),
        }
    };
    let mode = if rt.get_top() >= 3 && !rt.is_nil(3) {
        rt.to_rust_string(3).unwrap_or_else(|| "bt".into())
    } else {
        "bt".into()
    };
    let source = match chunk {
        Value::Str(s) => rt.str_bytes(s).to_vec(),
        // Reader function: call repeatedly until it returns nil or "".
        Value::Closure(_) | Value::NativeClosure(_) | Value::NativeFn(_) => {
            let mut buf = Vec::new();
            loop {
                rt.push_index(1)?;
                rt.call(0, 1)?;
                let piece = rt.value_at(-1);
                match piece {
                    Value::Nil => {
                        rt.pop(1);
                        break;
                    }
                    Value::Str(s) => {
                        let bytes = rt.str_bytes(s).to_vec();
                        rt.pop(1);
                        if bytes.is_empty() {
                            break;
                        }
                        buf.extend_from_slice(&bytes);
                    }
                    _ => {
                        rt.pop(1);
                        rt.push_nil()?;
                        rt.push_str("reader function must return a string")?;
                        return Ok(2);
                    }
                }
            }
            buf
        }
        _ => return Err(arg_error(rt, 1, "string or function expected")),
    };
    let has_env = rt.get_top() >= 4 && !rt.is_nil(4);
    let status = rt.load_buffer(&source, &chunk_name, &mode);
    if status == Status::Ok {
        // Optional environment replaces the first upvalue.
        if has_env {
            rt.push_index(4)?;
            if rt.set_upvalue(-2, 1).is_none() {
                rt.pop(1);
            }
        }
        Ok(1)
    } else {
        rt.push_nil()?;
        rt.push_index(-2)?; // error message below the nil
        Ok(2)
    }
}

fn base_collectgarbage(rt: &mut Runtime) -> RtResult<u32> {
    let opt = if rt.get_top() >= 1 && !rt.is_nil(1) {
        rt.to_rust_string(1).unwrap_or_else(|| "collect".into())
    } else {
        "collect".into()
    };
    let arg = if rt.get_top() >= 2 { rt.to_integer(2).unwrap_or(0) } else { 0 };
    let result = match opt.as_str() {
        "collect" => rt.gc_control(GcOp::Collect, 0),
        "stop" => rt.gc_control(GcOp::Stop, 0),
        "restart" => rt.gc_control(GcOp::Restart, 0),
        "count" => {
            let kb = rt.gc_control(GcOp::Count, 0);
            let bytes = rt.gc_control(GcOp::CountBytes, 0);
            rt.push_float(kb as f64 + bytes as f64 / 1024.0)?;
            rt.push_int(bytes)?;
            return Ok(2);
        }
        "step" => rt.gc_control(GcOp::Step, arg.max(0) as usize),
        "setpause" => rt.gc_control(GcOp::SetPause, arg.max(0) as usize),
        "setstepmul" => rt.gc_control(GcOp::SetStepMul, arg.max(0) as usize),
        "isrunning" => {
            let running = rt.gc_control(GcOp::IsRunning, 0) != 0;
            rt.push_bool(running)?;
            return Ok(1);
        }
        _ => return Err(arg_error(rt, 1, "invalid option")),
    };
    rt.push_int(result)?;
    Ok(1)
}

fn string_dump(rt: &mut Runtime) -> RtResult<u32> {
    if !matches!(rt.value_at(1).type_of(), Type::Function) {
        return Err(arg_error(rt, 1, "function expected"));
    }
    let strip = rt.to_boolean(2);
    rt.push_index(1)?;
    match rt.dump_top(strip) {
        Some(bytes) => {
            rt.pop(1);
            rt.push_bytes(&bytes)?;
            Ok(1)
        }
        None => Err(ldebug::run_error(rt, "unable to dump given function".into())),
    }
}
