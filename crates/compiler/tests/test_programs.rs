//! Whole-program compilation tests: representative source shapes must
//! compile, and malformed ones must fail with positioned messages.

use selune_compiler::compile;

fn ok(src: &str) {
    if let Err(e) = compile(src.as_bytes(), b"=t") {
        panic!("expected {src:?} to compile, got: {e}");
    }
}

fn err(src: &str) -> String {
    match compile(src.as_bytes(), b"=t") {
        Ok(_) => panic!("expected {src:?} to fail"),
        Err(e) => e.to_string(),
    }
}

#[test]
fn statement_forms() {
    ok("");
    ok(";;;");
    ok("do end");
    ok("local a");
    ok("local a, b, c = 1, 2");
    ok("a = 1");
    ok("a, b = b, a");
    ok("a.b.c = 1");
    ok("a[1][2] = 3");
    ok("f()");
    ok("f(1)(2)(3)");
    ok("f 'string-arg'");
    ok("f {table = 'arg'}");
    ok("obj:method()");
    ok("obj.field:method(1, 2)");
    ok("return");
    ok("return 1");
    ok("return 1, 2, 3;");
    ok("while x do f() end");
    ok("repeat f() until x");
    ok("if a then f() elseif b then g() else h() end");
    ok("for i = 1, 10 do end");
    ok("for i = 10, 1, -2 do end");
    ok("for k, v in pairs(t) do end");
    ok("for a, b, c, d in iter do end");
    ok("function f() end");
    ok("function a.b.c:m() end");
    ok("local function f() return f() end");
    ok("goto done ::done::");
    ok("break_free = 1"); // not a keyword prefix issue
}

#[test]
fn expression_forms() {
    ok("return 1 + 2 * 3 ^ -4 % 5 // 6 - 7 / 8");
    ok("return a .. b .. c");
    ok("return a == b, a ~= b, a < b, a <= b, a > b, a >= b");
    ok("return a and b or c");
    ok("return not not x");
    ok("return #t, -x, ~n");
    ok("return 1 & 2 | 3 ~ 4 << 5 >> 6");
    ok("return {}");
    ok("return {1, 2; 3, x = 4, [y] = 5, f()}");
    ok("return function(a, b, ...) return ... end");
    ok("return (f())");
    ok("return a.b.c[d].e");
    ok("return 0x7fffffffffffffff, 1e100, .5, 0x.8p1");
    ok("return [[long]] .. [==[longer]==]");
}

#[test]
fn scoping_forms() {
    ok("local x local function f() return x end");
    ok("local x do local x = 2 end return x");
    ok("for i = 1, 2 do local j = i end");
    ok(r#"
        local upval = 0
        local function level1()
            local function level2()
                local function level3()
                    upval = upval + 1
                end
                level3()
            end
            level2()
        end
    "#);
}

#[test]
fn errors_are_positioned_and_descriptive() {
    assert!(err("local = 1").contains("<name> expected"));
    assert!(err("if x then").contains("'end' expected"));
    assert!(err("return 1 +").contains("unexpected symbol"));
    assert!(err("f(").contains("expected"));
    assert!(err("a = = 1").contains("unexpected symbol"));
    assert!(err("local a = [[unclosed").contains("unfinished long string"));
    assert!(err("::l:: ::l::").contains("already defined"));
    assert!(err("goto missing").contains("no visible label"));
    assert!(err("break").contains("break"));
    assert!(err("return ...").contains("vararg"));
    let msg = err("\n\n\nlocal = 1");
    assert!(msg.contains(":4:"), "line missing in {msg:?}");
}

#[test]
fn deep_nesting_hits_the_limit_not_the_stack() {
    let mut src = String::new();
    for _ in 0..300 {
        src.push_str("if x then ");
    }
    let msg = err(&src);
    assert!(msg.contains("too many syntax levels") || msg.contains("expected"), "got {msg:?}");

    let deep_parens = format!("return {}x{}", "(".repeat(300), ")".repeat(300));
    let msg = err(&deep_parens);
    assert!(msg.contains("too many syntax levels"), "got {msg:?}");
}

#[test]
fn register_budget_is_enforced() {
    // A single expression wide enough to exhaust the register file.
    let wide = format!("return {}", vec!["1"; 300].join(" .. "));
    let msg = err(&wide);
    assert!(
        msg.contains("too many registers") || msg.contains("too many"),
        "got {msg:?}"
    );
}

#[test]
fn too_many_locals_rejected() {
    let mut src = String::new();
    for i in 0..250 {
        src.push_str(&format!("local v{i} = {i}\n"));
    }
    let msg = err(&src);
    assert!(msg.contains("too many local variables"), "got {msg:?}");
}

#[test]
fn constant_dedup_across_function() {
    let p = compile(b"return 'k', 'k', 'k', 1, 1, 1.0", b"=t").unwrap();
    // One string, one int, one float.
    assert_eq!(p.constants.len(), 3);
}

#[test]
fn nested_protos_compile_in_place() {
    let p = compile(
        b"local function a() end local function b() local function c() end end",
        b"=t",
    )
    .unwrap();
    assert_eq!(p.protos.len(), 2);
    assert_eq!(p.protos[1].protos.len(), 1);
}

#[test]
fn chunk_compiles_to_dumpable_form() {
    let p = compile(b"local x = 1 return function() return x end", b"=t").unwrap();
    let bin = selune_core::dump_chunk(&p, false);
    let back = selune_core::undump_chunk(&bin).unwrap();
    assert_eq!(back, p);
}
