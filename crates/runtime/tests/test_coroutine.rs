//! Coroutine behavior: resume/yield round trips, status transitions,
//! error propagation, and yields crossing protected calls.

use selune_runtime::{Runtime, Value};

fn run(src: &str) -> Vec<String> {
    let mut rt = Runtime::with_corelib();
    let n = rt.do_string(src.as_bytes(), "=test").expect("chunk runs");
    (0..n)
        .map(|i| {
            let idx = -(n as i32) + i as i32;
            rt.to_rust_string(idx).unwrap_or_else(|| {
                let v = rt.value_at(idx);
                rt.display_value(&v)
            })
        })
        .collect()
}

#[test]
fn resume_yield_round_trip() {
    // Values flow in through resume and out through yield, both ways.
    let out = run(r#"
        local co = coroutine.create(function(x)
            local y = coroutine.yield(x + 1)
            return y * 2
        end)
        local a, b = coroutine.resume(co, 10)
        local c, d = coroutine.resume(co, 100)
        return a, b, c, d
    "#);
    assert_eq!(out, ["true", "11", "true", "200"]);
}

#[test]
fn multiple_yield_values() {
    let out = run(r#"
        local co = coroutine.create(function()
            local a, b = coroutine.yield(1, 2, 3)
            return a + b
        end)
        local ok, x, y, z = coroutine.resume(co)
        local ok2, sum = coroutine.resume(co, 10, 20)
        return x, y, z, sum
    "#);
    assert_eq!(out, ["1", "2", "3", "30"]);
}

#[test]
fn status_transitions() {
    let out = run(r#"
        local co = coroutine.create(function() coroutine.yield() end)
        local s1 = coroutine.status(co)
        coroutine.resume(co)
        local s2 = coroutine.status(co)
        coroutine.resume(co)
        local s3 = coroutine.status(co)
        return s1, s2, s3
    "#);
    assert_eq!(out, ["suspended", "suspended", "dead"]);
}

#[test]
fn resume_dead_coroutine_fails() {
    let out = run(r#"
        local co = coroutine.create(function() return 1 end)
        coroutine.resume(co)
        local ok, err = coroutine.resume(co)
        return ok, err
    "#);
    assert_eq!(out[0], "false");
    assert!(out[1].contains("dead"), "error was {:?}", out[1]);
}

#[test]
fn coroutine_error_is_reported_to_resumer() {
    let out = run(r#"
        local co = coroutine.create(function() error("inside") end)
        local ok, err = coroutine.resume(co)
        return ok, err, coroutine.status(co)
    "#);
    assert_eq!(out[0], "false");
    assert!(out[1].contains("inside"), "error was {:?}", out[1]);
    assert_eq!(out[2], "dead");
}

#[test]
fn wrap_propagates_values_and_errors() {
    let out = run(r#"
        local gen = coroutine.wrap(function()
            for i = 1, 3 do coroutine.yield(i) end
        end)
        local a, b, c = gen(), gen(), gen()
        local bad = coroutine.wrap(function() error("wrapped") end)
        local ok, err = pcall(bad)
        return a, b, c, ok
    "#);
    assert_eq!(out, ["1", "2", "3", "false"]);
}

#[test]
fn yield_across_pcall_with_continuation_support() {
    // pcall bodies can yield: the protected call is yieldable from
    // script code.
    let out = run(r#"
        local co = coroutine.create(function()
            local ok, v = pcall(function()
                local got = coroutine.yield("from-pcall")
                return got + 1
            end)
            return ok, v
        end)
        local _, first = coroutine.resume(co)
        local _, ok, v = coroutine.resume(co, 41)
        return first, ok, v
    "#);
    assert_eq!(out, ["from-pcall", "true", "42"]);
}

#[test]
fn error_after_yield_is_caught_by_interrupted_pcall() {
    let out = run(r#"
        local co = coroutine.create(function()
            local ok, err = pcall(function()
                coroutine.yield()
                error("late")
            end)
            return ok, err
        end)
        coroutine.resume(co)
        local _, ok, err = coroutine.resume(co)
        return ok, err
    "#);
    assert_eq!(out[0], "false");
    assert!(out[1].contains("late"), "error was {:?}", out[1]);
}

#[test]
fn yield_from_nested_script_calls() {
    let out = run(r#"
        local function inner() return coroutine.yield("deep") end
        local function outer() return inner() end
        local co = coroutine.create(outer)
        local _, v = coroutine.resume(co)
        local _, r = coroutine.resume(co, "back")
        return v, r
    "#);
    assert_eq!(out, ["deep", "back"]);
}

#[test]
fn yield_inside_metamethod() {
    // Metamethods called from the VM may yield; the interrupted
    // instruction completes on resume.
    let out = run(r#"
        local t = setmetatable({}, {__index = function(_, k)
            return coroutine.yield(k) .. "!"
        end})
        local co = coroutine.create(function() return t.name end)
        local _, key = coroutine.resume(co)
        local _, result = coroutine.resume(co, "value")
        return key, result
    "#);
    assert_eq!(out, ["name", "value!"]);
}

#[test]
fn cannot_yield_from_main() {
    let out = run(r#"
        local ok, err = pcall(coroutine.yield)
        return ok, err
    "#);
    assert_eq!(out[0], "false");
    assert!(
        out[1].contains("outside a coroutine") || out[1].contains("C-call boundary"),
        "error was {:?}",
        out[1]
    );
}

#[test]
fn isyieldable_reflects_context() {
    let out = run(r#"
        local main_yieldable = coroutine.isyieldable()
        local co = coroutine.create(function()
            coroutine.yield(coroutine.isyieldable())
        end)
        local _, inside = coroutine.resume(co)
        return main_yieldable, inside
    "#);
    assert_eq!(out, ["false", "true"]);
}

#[test]
fn running_identifies_threads() {
    let out = run(r#"
        local main, is_main = coroutine.running()
        local co = coroutine.create(function()
            local inner, inner_is_main = coroutine.running()
            coroutine.yield(inner_is_main)
        end)
        local _, inner_is_main = coroutine.resume(co)
        return is_main, inner_is_main, type(main)
    "#);
    assert_eq!(out, ["true", "false", "thread"]);
}

#[test]
fn coroutines_have_independent_stacks() {
    let out = run(r#"
        local function counter()
            local n = 0
            while true do
                n = n + 1
                coroutine.yield(n)
            end
        end
        local a = coroutine.wrap(counter)
        local b = coroutine.wrap(counter)
        a(); a()
        return a(), b()
    "#);
    assert_eq!(out, ["3", "1"]);
}

#[test]
fn api_level_resume() {
    // Drive a coroutine from the host without script glue.
    let mut rt = Runtime::with_corelib();
    rt.do_string(
        b"co = coroutine.create(function(x) local y = coroutine.yield(x * 2) return y + 1 end)",
        "=setup",
    )
    .expect("setup runs");
    rt.get_global_field("co").expect("co exists");
    let co = rt.to_thread(-1).expect("a thread");
    rt.pop(1);
    rt.push_int(21).unwrap();
    let (status, nres) = rt.resume(co, 1);
    assert_eq!(status, selune_runtime::Status::Yield);
    assert_eq!(nres, 1);
    assert!(matches!(rt.value_at(-1), Value::Int(42)));
    rt.pop(1);
    rt.push_int(99).unwrap();
    let (status, nres) = rt.resume(co, 1);
    assert_eq!(status, selune_runtime::Status::Ok);
    assert_eq!(nres, 1);
    assert!(matches!(rt.value_at(-1), Value::Int(100)));
}
