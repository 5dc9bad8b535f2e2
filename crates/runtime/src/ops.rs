//! Value operations with metamethod fallback: arithmetic, comparison,
//! concatenation, length, and the `__index`/`__newindex` chains.
//!
//! Every operation has a numeric (or string) fast path computed
//! directly, falling back to metamethod dispatch. Mixed integer/float
//! comparisons never round: out-of-range floats are decided against
//! the type bounds, in-range floats through `floor`.

use selune_core::limits::MAX_META_CHAIN;
use selune_core::numeric::{self, Number};

use crate::call;
use crate::error::RtResult;
use crate::ldebug;
use crate::meta::Tm;
use crate::state::{CallFlags, Runtime};
use crate::value::Value;

/// 2^63 as a float, the first float above every i64.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

// ======================================================================
// Coercions
// ======================================================================

/// Numeric view with string coercion.
pub fn to_number(rt: &Runtime, v: &Value) -> Option<Number> {
    match v {
        Value::Int(i) => Some(Number::Int(*i)),
        Value::Float(f) => Some(Number::Float(*f)),
        Value::Str(s) => {
            let text = std::str::from_utf8(rt.str_bytes(*s)).ok()?;
            numeric::str_to_number(text)
        }
        _ => None,
    }
}

/// Integer view with string coercion; floats must be integral.
pub fn to_integer(rt: &Runtime, v: &Value) -> Option<i64> {
    match to_number(rt, v)? {
        Number::Int(i) => Some(i),
        Number::Float(f) => numeric::float_to_int_exact(f),
    }
}

/// Convert the value in `slot` to a string in place when it is a
/// number. Returns false for values with no string conversion.
pub fn tostring_coerce(rt: &mut Runtime, slot: usize) -> bool {
    let v = rt.th().stack[slot];
    match v {
        Value::Str(_) => true,
        Value::Int(i) => {
            let s = rt.new_string_value(&numeric::int_to_display(i));
            rt.th_mut().stack[slot] = s;
            true
        }
        Value::Float(f) => {
            let s = rt.new_string_value(&numeric::float_to_display(f));
            rt.th_mut().stack[slot] = s;
            true
        }
        _ => false,
    }
}

fn is_function(v: &Value) -> bool {
    matches!(v, Value::Closure(_) | Value::NativeClosure(_) | Value::NativeFn(_))
}

// ======================================================================
// Metamethod invocation
// ======================================================================

/// Call `f(a, b)` expecting one result, stored into stack slot `res`.
pub fn call_tm_res(rt: &mut Runtime, f: Value, a: Value, b: Value, res: usize) -> RtResult<()> {
    rt.ensure_stack(3)?;
    let func = rt.th().top;
    {
        let th = rt.th_mut();
        th.stack[func] = f;
        th.stack[func + 1] = a;
        th.stack[func + 2] = b;
        th.top = func + 3;
    }
    if rt.th().frame().is_lua() {
        call::call_value(rt, func, 1)?;
    } else {
        call::call_no_yield(rt, func, 1)?;
    }
    let th = rt.th_mut();
    th.top -= 1;
    let v = th.stack[th.top];
    th.stack[res] = v;
    Ok(())
}

/// Call `f(a, b, c)` for effect (the `__newindex` shape).
pub fn call_tm_nores(rt: &mut Runtime, f: Value, a: Value, b: Value, c: Value) -> RtResult<()> {
    rt.ensure_stack(4)?;
    let func = rt.th().top;
    {
        let th = rt.th_mut();
        th.stack[func] = f;
        th.stack[func + 1] = a;
        th.stack[func + 2] = b;
        th.stack[func + 3] = c;
        th.top = func + 4;
    }
    if rt.th().frame().is_lua() {
        call::call_value(rt, func, 0)
    } else {
        call::call_no_yield(rt, func, 0)
    }
}

// ======================================================================
// Arithmetic
// ======================================================================

/// The numeric result of `event` over numbers, or the reason there is
/// none.
enum RawArith {
    Done(Value),
    /// Integer division/modulus by zero.
    DivZero,
    /// Bitwise operand with no integer representation.
    NoInt,
    /// Operand is not numeric at all.
    NotNumber,
}

fn raw_arith(rt: &Runtime, event: Tm, a: &Value, b: &Value) -> RawArith {
    use Number::{Float, Int};
    let bitwise = matches!(
        event,
        Tm::BAnd | Tm::BOr | Tm::BXor | Tm::Shl | Tm::Shr | Tm::BNot
    );
    if bitwise {
        let (Some(x), Some(y)) = (coerce_int(rt, a), coerce_int(rt, b)) else {
            // Distinguish "not a number" from "number with no integer
            // representation".
            let nums = to_number(rt, a).is_some()
                && (matches!(event, Tm::BNot) || to_number(rt, b).is_some());
            return if nums { RawArith::NoInt } else { RawArith::NotNumber };
        };
        let r = match event {
            Tm::BAnd => x & y,
            Tm::BOr => x | y,
            Tm::BXor => x ^ y,
            Tm::Shl => numeric::shift_left(x, y),
            Tm::Shr => numeric::shift_left(x, y.wrapping_neg()),
            Tm::BNot => !x,
            _ => unreachable!(),
        };
        return RawArith::Done(Value::Int(r));
    }
    let (Some(na), Some(nb)) = (to_number(rt, a), to_number(rt, b)) else {
        return RawArith::NotNumber;
    };
    let as_f = |n: Number| match n {
        Int(i) => i as f64,
        Float(f) => f,
    };
    let v = match (event, na, nb) {
        (Tm::Add, Int(x), Int(y)) => Value::Int(x.wrapping_add(y)),
        (Tm::Add, x, y) => Value::Float(as_f(x) + as_f(y)),
        (Tm::Sub, Int(x), Int(y)) => Value::Int(x.wrapping_sub(y)),
        (Tm::Sub, x, y) => Value::Float(as_f(x) - as_f(y)),
        (Tm::Mul, Int(x), Int(y)) => Value::Int(x.wrapping_mul(y)),
        (Tm::Mul, x, y) => Value::Float(as_f(x) * as_f(y)),
        (Tm::Div, x, y) => Value::Float(as_f(x) / as_f(y)),
        (Tm::Pow, x, y) => Value::Float(as_f(x).powf(as_f(y))),
        (Tm::IDiv, Int(x), Int(y)) => match numeric::int_floor_div(x, y) {
            Some(r) => Value::Int(r),
            None => return RawArith::DivZero,
        },
        (Tm::IDiv, x, y) => Value::Float(numeric::float_floor_div(as_f(x), as_f(y))),
        (Tm::Mod, Int(x), Int(y)) => match numeric::int_floor_mod(x, y) {
            Some(r) => Value::Int(r),
            None => return RawArith::DivZero,
        },
        (Tm::Mod, x, y) => Value::Float(numeric::float_floor_mod(as_f(x), as_f(y))),
        (Tm::Unm, Int(x), _) => Value::Int(x.wrapping_neg()),
        (Tm::Unm, Float(x), _) => Value::Float(-x),
        _ => unreachable!("not an arithmetic event"),
    };
    RawArith::Done(v)
}

fn coerce_int(rt: &Runtime, v: &Value) -> Option<i64> {
    to_integer(rt, v)
}

/// `res := a event b` (or unary with `b == a`), with metamethod
/// fallback.
pub fn arith(rt: &mut Runtime, event: Tm, a: Value, b: Value, res: usize) -> RtResult<()> {
    match raw_arith(rt, event, &a, &b) {
        RawArith::Done(v) => {
            rt.th_mut().stack[res] = v;
            Ok(())
        }
        RawArith::DivZero => {
            let what = if event == Tm::Mod { "perform 'n%0'" } else { "perform 'n//0'" };
            Err(ldebug::run_error(rt, format!("attempt to {what}")))
        }
        _ => {
            let tm = {
                let t = rt.tm_of(&a, event);
                if t.is_nil() { rt.tm_of(&b, event) } else { t }
            };
            if !tm.is_nil() {
                return call_tm_res(rt, tm, a, b, res);
            }
            match raw_arith(rt, event, &a, &b) {
                RawArith::NoInt => {
                    let culprit = if to_integer(rt, &a).is_none() { a } else { b };
                    Err(ldebug::to_int_error(rt, &culprit))
                }
                _ => {
                    let culprit = if to_number(rt, &a).is_none() { a } else { b };
                    Err(ldebug::op_error(rt, &culprit, "perform arithmetic on"))
                }
            }
        }
    }
}

// ======================================================================
// Comparison
// ======================================================================

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f < -TWO_POW_63 {
        false
    } else {
        let fi = f.floor();
        i < fi as i64 || (i == fi as i64 && f > fi)
    }
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f < -TWO_POW_63 {
        true
    } else {
        (f.floor() as i64) < i
    }
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f < -TWO_POW_63 {
        false
    } else {
        i <= f.floor() as i64
    }
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f < -TWO_POW_63 {
        true
    } else {
        f.floor() as i64 <= i
    }
}

pub fn num_lt(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x < y,
        (Number::Float(x), Number::Float(y)) => x < y,
        (Number::Int(x), Number::Float(y)) => int_lt_float(x, y),
        (Number::Float(x), Number::Int(y)) => float_lt_int(x, y),
    }
}

pub fn num_le(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x <= y,
        (Number::Float(x), Number::Float(y)) => x <= y,
        (Number::Int(x), Number::Float(y)) => int_le_float(x, y),
        (Number::Float(x), Number::Int(y)) => float_le_int(x, y),
    }
}

fn call_order_tm(rt: &mut Runtime, a: Value, b: Value, event: Tm) -> RtResult<Option<bool>> {
    let tm = {
        let t = rt.tm_of(&a, event);
        if t.is_nil() { rt.tm_of(&b, event) } else { t }
    };
    if tm.is_nil() {
        return Ok(None);
    }
    let res = rt.th().top; // scratch above the frame top
    rt.ensure_stack(1)?;
    call_tm_res(rt, tm, a, b, res)?;
    Ok(Some(rt.th().stack[res].truthy()))
}

pub fn less_than(rt: &mut Runtime, a: Value, b: Value) -> RtResult<bool> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(num_lt(x, y));
    }
    if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
        return Ok(rt.str_bytes(*x) < rt.str_bytes(*y));
    }
    match call_order_tm(rt, a, b, Tm::Lt)? {
        Some(r) => Ok(r),
        None => Err(ldebug::order_error(rt, &a, &b)),
    }
}

pub fn less_equal(rt: &mut Runtime, a: Value, b: Value) -> RtResult<bool> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(num_le(x, y));
    }
    if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
        return Ok(rt.str_bytes(*x) <= rt.str_bytes(*y));
    }
    if let Some(r) = call_order_tm(rt, a, b, Tm::Le)? {
        return Ok(r);
    }
    // No __le: fall back to not (b < a), flagged so a yielding
    // continuation knows to negate.
    rt.th_mut().frame_mut().flags |= CallFlags::LEQ;
    let r = call_order_tm(rt, b, a, Tm::Lt)?;
    rt.th_mut().frame_mut().flags &= !CallFlags::LEQ;
    match r {
        Some(r) => Ok(!r),
        None => Err(ldebug::order_error(rt, &a, &b)),
    }
}

/// Full equality: primitive comparison, strings by content, then
/// `__eq` when both operands are tables or both are userdata.
pub fn equal_values(rt: &mut Runtime, a: Value, b: Value) -> RtResult<bool> {
    let primitive = match (&a, &b) {
        (Value::Str(x), Value::Str(y)) => crate::lstr::str_eq(&rt.heap, *x, *y),
        _ => a.raw_eq_non_string(&b),
    };
    if primitive {
        return Ok(true);
    }
    let both_tables = matches!((&a, &b), (Value::Table(_), Value::Table(_)));
    let both_userdata = matches!((&a, &b), (Value::Userdata(_), Value::Userdata(_)));
    if !(both_tables || both_userdata) {
        return Ok(false);
    }
    let tm = {
        let t = rt.tm_of(&a, Tm::Eq);
        if t.is_nil() { rt.tm_of(&b, Tm::Eq) } else { t }
    };
    if tm.is_nil() {
        return Ok(false);
    }
    let res = rt.th().top;
    rt.ensure_stack(1)?;
    call_tm_res(rt, tm, a, b, res)?;
    Ok(rt.th().stack[res].truthy())
}

// ======================================================================
// Length and concatenation
// ======================================================================

pub fn object_len(rt: &mut Runtime, v: Value, res: usize) -> RtResult<()> {
    match v {
        Value::Str(s) => {
            let n = rt.str_bytes(s).len() as i64;
            rt.th_mut().stack[res] = Value::Int(n);
            Ok(())
        }
        Value::Table(t) => {
            let tm = rt.tm_of(&v, Tm::Len);
            if tm.is_nil() {
                let n = rt.heap.table(t).length();
                rt.th_mut().stack[res] = Value::Int(n);
                Ok(())
            } else {
                call_tm_res(rt, tm, v, v, res)
            }
        }
        _ => {
            let tm = rt.tm_of(&v, Tm::Len);
            if tm.is_nil() {
                return Err(ldebug::op_error(rt, &v, "get length of"));
            }
            call_tm_res(rt, tm, v, v, res)
        }
    }
}

fn concatable(v: &Value) -> bool {
    matches!(v, Value::Str(_) | Value::Int(_) | Value::Float(_))
}

/// Concatenate the top `total` stack values into one, fusing runs of
/// strings/numbers and dispatching `__concat` elsewhere. The result
/// replaces them at the first slot.
pub fn concat_stack(rt: &mut Runtime, mut total: usize) -> RtResult<()> {
    debug_assert!(total >= 2);
    while total > 1 {
        let top = rt.th().top;
        let n;
        let a = rt.th().stack[top - 2];
        let b = rt.th().stack[top - 1];
        let first_ok = concatable(&a);
        let second_ok = concatable(&b);
        if !(first_ok && second_ok) {
            let tm = {
                let t = rt.tm_of(&a, Tm::Concat);
                if t.is_nil() { rt.tm_of(&b, Tm::Concat) } else { t }
            };
            if tm.is_nil() {
                let culprit = if first_ok { b } else { a };
                return Err(ldebug::op_error(rt, &culprit, "concatenate"));
            }
            call_tm_res(rt, tm, a, b, top - 2)?;
            n = 2;
        } else if is_empty_str(rt, &b) {
            tostring_coerce(rt, top - 2);
            n = 2;
        } else if is_empty_str(rt, &a) {
            rt.th_mut().stack[top - 2] = b;
            n = 2;
        } else {
            // Fuse the longest run of coercible operands below top.
            let mut count = 1;
            tostring_coerce(rt, top - 1);
            while count < total && tostring_coerce(rt, top - count - 1) {
                count += 1;
            }
            let mut buf = Vec::new();
            for i in (0..count).rev() {
                let v = rt.th().stack[top - 1 - i];
                match v {
                    Value::Str(s) => buf.extend_from_slice(rt.str_bytes(s)),
                    _ => unreachable!("coerced above"),
                }
            }
            let s = rt.new_string(&buf);
            rt.th_mut().stack[top - count] = Value::Str(s);
            n = count;
        }
        total -= n - 1;
        rt.th_mut().top -= n - 1;
    }
    Ok(())
}

fn is_empty_str(rt: &Runtime, v: &Value) -> bool {
    matches!(v, Value::Str(s) if rt.str_bytes(*s).is_empty())
}

// ======================================================================
// Indexing
// ======================================================================

/// `res := t[key]`, walking the `__index` chain.
pub fn index_get(rt: &mut Runtime, t: Value, key: Value, res: usize) -> RtResult<()> {
    let mut t = t;
    for _ in 0..MAX_META_CHAIN {
        if let Value::Table(tr) = t {
            let raw = rt.table_get(tr, &key);
            if !raw.is_nil() {
                rt.th_mut().stack[res] = raw;
                return Ok(());
            }
            let tm = rt.tm_of(&t, Tm::Index);
            if tm.is_nil() {
                rt.th_mut().stack[res] = Value::Nil;
                return Ok(());
            }
            if is_function(&tm) {
                return call_tm_res(rt, tm, t, key, res);
            }
            t = tm;
        } else {
            let tm = rt.tm_of(&t, Tm::Index);
            if tm.is_nil() {
                return Err(ldebug::index_error(rt, &t, &key));
            }
            if is_function(&tm) {
                return call_tm_res(rt, tm, t, key, res);
            }
            t = tm;
        }
    }
    Err(ldebug::run_error(rt, "'__index' chain too long; possible loop".into()))
}

/// `t[key] = value`, walking the `__newindex` chain.
pub fn index_set(rt: &mut Runtime, t: Value, key: Value, value: Value) -> RtResult<()> {
    let mut t = t;
    for _ in 0..MAX_META_CHAIN {
        if let Value::Table(tr) = t {
            let raw = rt.table_get(tr, &key);
            if !raw.is_nil() {
                // Existing entries are updated raw, hooks unconsulted.
                return raw_set_checked(rt, tr, key, value);
            }
            let tm = rt.tm_of(&t, Tm::NewIndex);
            if tm.is_nil() {
                return raw_set_checked(rt, tr, key, value);
            }
            if is_function(&tm) {
                return call_tm_nores(rt, tm, t, key, value);
            }
            t = tm;
        } else {
            let tm = rt.tm_of(&t, Tm::NewIndex);
            if tm.is_nil() {
                return Err(ldebug::index_error(rt, &t, &key));
            }
            if is_function(&tm) {
                return call_tm_nores(rt, tm, t, key, value);
            }
            t = tm;
        }
    }
    Err(ldebug::run_error(rt, "'__newindex' chain too long; possible loop".into()))
}

/// Raw table store mapping key errors to runtime errors.
pub fn raw_set_checked(
    rt: &mut Runtime,
    t: crate::heap::TableRef,
    key: Value,
    value: Value,
) -> RtResult<()> {
    match rt.table_set(t, key, value) {
        Ok(()) => Ok(()),
        Err(crate::table::TableError::NilIndex) => {
            Err(ldebug::run_error(rt, "table index is nil".into()))
        }
        Err(crate::table::TableError::NanIndex) => {
            Err(ldebug::run_error(rt, "table index is NaN".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_comparisons_avoid_rounding() {
        // 2^63 as a float equals 2^63, which is > i64::MAX.
        assert!(num_lt(Number::Int(i64::MAX), Number::Float(TWO_POW_63)));
        assert!(!num_lt(Number::Float(TWO_POW_63), Number::Int(i64::MAX)));
        assert!(num_le(Number::Int(5), Number::Float(5.0)));
        assert!(num_lt(Number::Int(3), Number::Float(3.5)));
        assert!(!num_lt(Number::Int(4), Number::Float(3.5)));
        assert!(num_lt(Number::Float(3.5), Number::Int(4)));
        assert!(!num_le(Number::Float(4.5), Number::Int(4)));
        assert!(!num_lt(Number::Int(1), Number::Float(f64::NAN)));
        assert!(!num_le(Number::Float(f64::NAN), Number::Int(1)));
        assert!(num_lt(Number::Float(-TWO_POW_63 * 2.0), Number::Int(i64::MIN)));
    }
}
