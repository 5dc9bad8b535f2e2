//! Host embedding API: stack discipline, index addressing, table
//! access, native closures and upvalues, debug introspection.

use selune_runtime::{
    CoStatus, HookEvent, MASK_COUNT, REGISTRY_INDEX, RtResult, Runtime, Status, Type, Value,
    upvalue_index,
};

#[test]
fn push_and_index_addressing() {
    let mut rt = Runtime::new();
    rt.push_int(1).unwrap();
    rt.push_str("two").unwrap();
    rt.push_bool(true).unwrap();
    assert_eq!(rt.get_top(), 3);
    assert_eq!(rt.to_integer(1), Some(1));
    assert_eq!(rt.to_rust_string(2).as_deref(), Some("two"));
    assert!(rt.to_boolean(3));
    // Negative indices count from the top.
    assert!(rt.to_boolean(-1));
    assert_eq!(rt.to_rust_string(-2).as_deref(), Some("two"));
    assert_eq!(rt.abs_index(-1), 3);
    rt.pop(2);
    assert_eq!(rt.get_top(), 1);
}

#[test]
fn set_top_fills_with_nil() {
    let mut rt = Runtime::new();
    rt.push_int(1).unwrap();
    rt.set_top(4);
    assert_eq!(rt.get_top(), 4);
    assert!(rt.is_nil(4));
    rt.set_top(0);
    assert_eq!(rt.get_top(), 0);
}

#[test]
fn rotate_insert_remove_replace() {
    let mut rt = Runtime::new();
    for i in 1..=4 {
        rt.push_int(i).unwrap();
    }
    rt.insert(2); // 1 4 2 3
    assert_eq!(rt.to_integer(2), Some(4));
    rt.remove(2); // 1 2 3
    assert_eq!(rt.to_integer(2), Some(2));
    rt.push_int(99).unwrap();
    rt.replace(1); // 99 2 3
    assert_eq!(rt.to_integer(1), Some(99));
    assert_eq!(rt.get_top(), 3);
}

#[test]
fn type_queries() {
    let mut rt = Runtime::new();
    rt.push_nil().unwrap();
    rt.push_float(1.5).unwrap();
    rt.push_str("s").unwrap();
    rt.create_table(0, 0).unwrap();
    assert_eq!(rt.type_at(1), Some(Type::Nil));
    assert_eq!(rt.type_at(2), Some(Type::Number));
    assert_eq!(rt.type_at(3), Some(Type::String));
    assert_eq!(rt.type_at(4), Some(Type::Table));
    assert_eq!(rt.type_at(99), None);
}

#[test]
fn number_conversions() {
    let mut rt = Runtime::new();
    rt.push_str("0x10").unwrap();
    rt.push_float(3.0).unwrap();
    rt.push_float(3.5).unwrap();
    assert_eq!(rt.to_integer(1), Some(16));
    assert_eq!(rt.to_integer(2), Some(3));
    assert_eq!(rt.to_integer(3), None);
    assert_eq!(rt.to_number(3), Some(3.5));
}

#[test]
fn table_round_trip_through_api() {
    let mut rt = Runtime::new();
    rt.create_table(0, 4).unwrap();
    rt.push_int(42).unwrap();
    rt.set_field(-2, "answer").unwrap();
    rt.push_str("v").unwrap();
    rt.set_index(-2, 5).unwrap();
    assert_eq!(rt.get_field(-1, "answer").unwrap(), Type::Number);
    assert_eq!(rt.to_integer(-1), Some(42));
    rt.pop(1);
    assert_eq!(rt.get_index(-1, 5).unwrap(), Type::String);
    assert_eq!(rt.to_rust_string(-1).as_deref(), Some("v"));
    rt.pop(1);
    assert_eq!(rt.raw_len(-1), 0); // no dense prefix from slot 1
}

#[test]
fn globals_and_registry() {
    let mut rt = Runtime::new();
    rt.push_int(7).unwrap();
    rt.set_global_field("lucky").unwrap();
    assert_eq!(rt.get_global_field("lucky").unwrap(), Type::Number);
    assert_eq!(rt.to_integer(-1), Some(7));
    rt.pop(1);
    // The registry is addressable via its pseudo-index.
    rt.push_str("hidden").unwrap();
    rt.set_field(REGISTRY_INDEX, "stash").unwrap();
    rt.get_field(REGISTRY_INDEX, "stash").unwrap();
    assert_eq!(rt.to_rust_string(-1).as_deref(), Some("hidden"));
}

fn adder(rt: &mut Runtime) -> RtResult<u32> {
    let a = rt.to_integer(1).unwrap_or(0);
    let b = rt.to_integer(2).unwrap_or(0);
    rt.push_int(a + b)?;
    Ok(1)
}

#[test]
fn native_function_calls() {
    let mut rt = Runtime::new();
    rt.push_native(adder).unwrap();
    rt.push_int(20).unwrap();
    rt.push_int(22).unwrap();
    rt.call(2, 1).unwrap();
    assert_eq!(rt.to_integer(-1), Some(42));
}

fn counter(rt: &mut Runtime) -> RtResult<u32> {
    let n = rt.to_integer(upvalue_index(1)).unwrap_or(0) + 1;
    rt.push_int(n)?;
    rt.copy(-1, upvalue_index(1));
    Ok(1)
}

#[test]
fn native_closure_upvalues() {
    let mut rt = Runtime::new();
    rt.push_int(0).unwrap();
    rt.push_native_closure(counter, 1).unwrap();
    rt.set_global_field("tick").unwrap();
    for expected in 1..=3 {
        rt.get_global_field("tick").unwrap();
        rt.call(0, 1).unwrap();
        assert_eq!(rt.to_integer(-1), Some(expected));
        rt.pop(1);
    }
}

#[test]
fn native_functions_callable_from_scripts() {
    let mut rt = Runtime::with_corelib();
    rt.push_native(adder).unwrap();
    rt.set_global_field("add").unwrap();
    let n = rt.do_string(b"return add(40, 2)", "=test").unwrap();
    assert_eq!(n, 1);
    assert_eq!(rt.to_integer(-1), Some(42));
}

#[test]
fn pcall_at_api_level_catches() {
    fn thrower(rt: &mut Runtime) -> RtResult<u32> {
        rt.push_str("native failure").unwrap();
        Err(rt.error_api())
    }
    let mut rt = Runtime::new();
    rt.push_native(thrower).unwrap();
    let status = rt.pcall(0, 0, 0);
    assert_eq!(status, Status::ErrRun);
    assert!(rt.to_rust_string(-1).unwrap().contains("native failure"));
}

#[test]
fn xmove_between_threads() {
    let mut rt = Runtime::new();
    let co = rt.new_thread_api().unwrap();
    rt.push_int(5).unwrap();
    rt.push_int(6).unwrap();
    rt.xmove(co, 2);
    assert_eq!(rt.get_top(), 1); // only the thread remains
    let th = rt.heap.thread(co);
    assert_eq!(th.top, 3);
    assert!(matches!(th.stack[1], Value::Int(5)));
    assert!(matches!(th.stack[2], Value::Int(6)));
}

#[test]
fn next_entry_iterates() {
    let mut rt = Runtime::new();
    rt.create_table(0, 0).unwrap();
    for i in 1..=3 {
        rt.push_int(i * 10).unwrap();
        rt.set_index(-2, i).unwrap();
    }
    rt.push_nil().unwrap();
    let mut seen = 0;
    while rt.next_entry(1).unwrap() {
        seen += 1;
        rt.pop(1); // drop the value, keep the key
    }
    assert_eq!(seen, 3);
}

#[test]
fn metatable_round_trip() {
    let mut rt = Runtime::new();
    rt.create_table(0, 0).unwrap(); // the value
    assert!(!rt.get_metatable_api(1).unwrap());
    rt.create_table(0, 1).unwrap(); // the metatable
    rt.set_metatable_api(1).unwrap();
    assert!(rt.get_metatable_api(1).unwrap());
    assert_eq!(rt.type_at(-1), Some(Type::Table));
}

#[test]
fn userdata_with_uservalue() {
    let mut rt = Runtime::new();
    rt.new_userdata_api(16).unwrap();
    assert_eq!(rt.raw_len(-1), 16);
    rt.push_str("attached").unwrap();
    rt.set_user_value(-2).unwrap();
    rt.get_user_value(-1).unwrap();
    assert_eq!(rt.to_rust_string(-1).as_deref(), Some("attached"));
}

#[test]
fn script_upvalue_inspection() {
    let mut rt = Runtime::with_corelib();
    rt.do_string(b"local x = 10 f = function() return x end", "=t").unwrap();
    rt.get_global_field("f").unwrap();
    let name = rt.get_upvalue(-1, 1).unwrap().expect("one upvalue");
    assert_eq!(name, "x");
    assert_eq!(rt.to_integer(-1), Some(10));
    rt.pop(1);
    // Writing through the API is visible to the closure.
    rt.push_int(77).unwrap();
    assert!(rt.set_upvalue(-2, 1).is_some());
    let n = rt.do_string(b"return f()", "=t").unwrap();
    assert_eq!(n, 1);
    assert_eq!(rt.to_integer(-1), Some(77));
}

#[test]
fn upvalue_id_and_join() {
    let mut rt = Runtime::with_corelib();
    rt.do_string(
        b"local a = 1 f = function() return a end g = function() return a end h = (function() local b = 2 return function() return b end end)()",
        "=t",
    )
    .unwrap();
    rt.get_global_field("f").unwrap();
    rt.get_global_field("g").unwrap();
    rt.get_global_field("h").unwrap();
    let f_id = rt.upvalue_id(1, 1).unwrap();
    let g_id = rt.upvalue_id(2, 1).unwrap();
    let h_id = rt.upvalue_id(3, 1).unwrap();
    assert_eq!(f_id, g_id, "same captured local, same cell");
    assert_ne!(f_id, h_id);
    // Join h's upvalue to f's cell.
    rt.upvalue_join(3, 1, 1, 1);
    assert_eq!(rt.upvalue_id(3, 1).unwrap(), f_id);
}

#[test]
fn debug_getinfo_reports_source() {
    let mut rt = Runtime::with_corelib();
    rt.push_native(inspector).unwrap();
    rt.set_global_field("inspect").unwrap();
    rt.do_string(b"function probe() return inspect() end\nprobe()", "=chunk").unwrap();

    fn inspector(rt: &mut Runtime) -> RtResult<u32> {
        // Level 0 is this native function, level 1 the script caller.
        let idx = rt.get_stack_api(1).expect("caller frame");
        let info = rt.get_info_api(idx);
        assert_eq!(info.what, "Lua");
        assert_eq!(info.short_src, "chunk");
        assert!(info.current_line > 0);
        // The caller is the global function `probe`, named from its
        // own call site.
        assert_eq!(info.name.as_deref(), Some("probe"));
        assert_eq!(info.name_what, "global");
        Ok(0)
    }
}

#[test]
fn traceback_names_frames() {
    let mut rt = Runtime::with_corelib();
    rt.push_native(capture).unwrap();
    rt.set_global_field("capture").unwrap();

    fn capture(rt: &mut Runtime) -> RtResult<u32> {
        let tb = rt.traceback_api(Some("trace"), 0);
        rt.push_str(&tb)?;
        Ok(1)
    }

    let n = rt
        .do_string(
            b"local function inner() return capture() end\nlocal function outer() return inner() end\nreturn outer()",
            "=tb",
        )
        .unwrap();
    assert_eq!(n, 1);
    let tb = rt.to_rust_string(-1).unwrap();
    assert!(tb.starts_with("trace\nstack traceback:"), "got {tb}");
    assert!(tb.contains("in function 'capture'"), "got {tb}");
    assert!(tb.contains("in main chunk"), "got {tb}");
}

#[test]
fn count_hook_bounds_execution() {
    fn budget_hook(rt: &mut Runtime, event: HookEvent, _line: u32) -> RtResult<()> {
        assert_eq!(event, HookEvent::Count);
        Err(selune_runtime::ldebug::run_error(rt, "budget exceeded".into()))
    }
    let mut rt = Runtime::with_corelib();
    rt.set_hook(Some(budget_hook), MASK_COUNT, 1000);
    let err = rt
        .do_string(b"while true do end", "=spin")
        .expect_err("infinite loop is interrupted");
    assert!(err.contains("budget exceeded"), "got {err}");
}

#[test]
fn co_status_from_api() {
    let mut rt = Runtime::with_corelib();
    rt.do_string(b"co = coroutine.create(function() coroutine.yield() end)", "=t").unwrap();
    rt.get_global_field("co").unwrap();
    let co = rt.to_thread(-1).unwrap();
    assert_eq!(rt.co_status(co), CoStatus::Suspended);
    let (status, _) = rt.resume(co, 0);
    assert_eq!(status, Status::Yield);
    assert_eq!(rt.co_status(co), CoStatus::Suspended);
    let (status, _) = rt.resume(co, 0);
    assert_eq!(status, Status::Ok);
    assert_eq!(rt.co_status(co), CoStatus::Dead);
}

#[test]
fn get_local_names_frame_variables() {
    fn peek_locals(rt: &mut Runtime) -> RtResult<u32> {
        let idx = rt.get_stack_api(1).expect("caller frame");
        let name = rt.get_local(idx, 1).unwrap().expect("first local");
        assert_eq!(name, "width");
        assert_eq!(rt.to_integer(-1), Some(11));
        rt.pop(1);
        Ok(0)
    }
    let mut rt = Runtime::with_corelib();
    rt.push_native(peek_locals).unwrap();
    rt.set_global_field("peek").unwrap();
    rt.do_string(b"local function f() local width = 11 peek() end f()", "=t").unwrap();
}
