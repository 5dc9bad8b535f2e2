//! Garbage collector behavior: reachability, weak tables, ephemerons,
//! finalizers, and collector control.

use selune_runtime::{GcOp, Runtime};

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
fn reachable_objects_survive_full_collection() {
    let out = run(r#"
        local keep = {}
        for i = 1, 100 do keep[i] = {value = i} end
        collectgarbage("collect")
        collectgarbage("collect")
        local sum = 0
        for i = 1, 100 do sum = sum + keep[i].value end
        return sum
    "#);
    assert_eq!(out, ["5050"]);
}

#[test]
fn garbage_is_reclaimed() {
    let mut rt = Runtime::with_corelib();
    rt.do_string(b"for i = 1, 1000 do local t = {i, i, i} end", "=gen")
        .expect("runs");
    let before = rt.heap.total_bytes;
    rt.gc_control(GcOp::Collect, 0);
    let after = rt.heap.total_bytes;
    assert!(after <= before, "collection never grows the heap");
    // Interned strings for the core library remain.
    assert!(rt.heap.live_objects() > 0);
}

#[test]
fn collection_count_reports_kilobytes() {
    let mut rt = Runtime::with_corelib();
    let kb = rt.gc_control(GcOp::Count, 0);
    assert!(kb >= 0);
    let bytes = rt.gc_control(GcOp::CountBytes, 0);
    assert!((0..1024).contains(&bytes));
}

#[test]
fn stop_and_restart() {
    let mut rt = Runtime::with_corelib();
    rt.gc_control(GcOp::Stop, 0);
    assert_eq!(rt.gc_control(GcOp::IsRunning, 0), 0);
    rt.gc_control(GcOp::Restart, 0);
    assert_eq!(rt.gc_control(GcOp::IsRunning, 0), 1);
}

#[test]
fn incremental_steps_make_progress() {
    let mut rt = Runtime::with_corelib();
    rt.do_string(b"for i = 1, 2000 do local t = {i} end", "=gen").expect("runs");
    // Repeated explicit steps eventually finish a cycle.
    let mut finished = false;
    for _ in 0..10_000 {
        if rt.gc_control(GcOp::Step, 1) == 1 {
            finished = true;
            break;
        }
    }
    assert!(finished, "a bounded number of steps completes a cycle");
}

#[test]
fn weak_value_table_drops_dead_values() {
    let out = run(r#"
        local cache = setmetatable({}, {__mode = "v"})
        cache.alive = {1}
        cache.dead = {2}
        local keep = cache.alive
        cache.dead = {3}  -- old {2} is garbage now, {3} only weakly held
        collectgarbage("collect")
        return cache.alive ~= nil, cache.dead == nil, keep ~= nil
    "#);
    assert_eq!(out, ["true", "true", "true"]);
}

#[test]
fn weak_key_table_drops_dead_keys() {
    let out = run(r#"
        local t = setmetatable({}, {__mode = "k"})
        local strong = {}
        t[strong] = "kept"
        local weak = {}
        t[weak] = "dropped"
        weak = nil
        collectgarbage("collect")
        local count = 0
        for _ in pairs(t) do count = count + 1 end
        return count, t[strong]
    "#);
    assert_eq!(out, ["1", "kept"]);
}

#[test]
fn ephemeron_value_kept_only_while_key_lives() {
    let out = run(r#"
        local t = setmetatable({}, {__mode = "k"})
        local key = {}
        -- The value references its key: a classic ephemeron cycle that
        -- plain weak keys would leak or overcollect.
        t[key] = {owner = key}
        collectgarbage("collect")
        local kept = t[key] ~= nil
        key = nil
        collectgarbage("collect")
        local count = 0
        for _ in pairs(t) do count = count + 1 end
        return kept, count
    "#);
    assert_eq!(out, ["true", "0"]);
}

#[test]
fn strings_are_not_weak_cleared() {
    let out = run(r#"
        local t = setmetatable({}, {__mode = "v"})
        t.s = "a string value stays, strings are values not references"
        collectgarbage("collect")
        return t.s ~= nil
    "#);
    assert_eq!(out, ["true"]);
}

#[test]
fn finalizer_runs_for_unreachable_object() {
    // Registers keep values alive conservatively, so the local is
    // cleared explicitly before collecting.
    let out = run(r#"
        local finalized = 0
        local obj = setmetatable({}, {__gc = function() finalized = finalized + 1 end})
        obj = nil
        collectgarbage("collect")
        collectgarbage("collect")
        return finalized
    "#);
    assert_eq!(out, ["1"]);
}

#[test]
fn finalizers_run_in_reverse_registration_order() {
    let out = run(r#"
        local order = {}
        local a = setmetatable({}, {__gc = function() order[#order + 1] = "a" end})
        local b = setmetatable({}, {__gc = function() order[#order + 1] = "b" end})
        a, b = nil, nil
        collectgarbage("collect")
        collectgarbage("collect")
        return order[1], order[2]
    "#);
    assert_eq!(out, ["b", "a"]);
}

#[test]
fn finalizer_runs_at_most_once_despite_resurrection() {
    let out = run(r#"
        local runs = 0
        local limbo
        local obj = setmetatable({}, {__gc = function(o)
            runs = runs + 1
            limbo = o  -- resurrect
        end})
        obj = nil
        collectgarbage("collect")
        collectgarbage("collect")
        limbo = nil
        collectgarbage("collect")
        collectgarbage("collect")
        return runs
    "#);
    assert_eq!(out, ["1"]);
}

#[test]
fn upvalues_keep_objects_alive() {
    let out = run(r#"
        local function make()
            local data = {secret = 42}
            return function() return data.secret end
        end
        local f = make()
        collectgarbage("collect")
        return f()
    "#);
    assert_eq!(out, ["42"]);
}

#[test]
fn registry_roots_survive() {
    let mut rt = Runtime::with_corelib();
    rt.push_str("precious").unwrap();
    rt.set_field(selune_runtime::REGISTRY_INDEX, "anchor").unwrap();
    rt.gc_control(GcOp::Collect, 0);
    rt.get_field(selune_runtime::REGISTRY_INDEX, "anchor").unwrap();
    assert_eq!(rt.to_rust_string(-1).as_deref(), Some("precious"));
}

#[test]
fn collection_during_heavy_churn() {
    // Allocation-driven incremental steps must not free live data.
    let out = run(r#"
        collectgarbage("setstepmul", 400)
        collectgarbage("setpause", 100)
        local live = {}
        for round = 1, 50 do
            for i = 1, 100 do
                local garbage = {round, i, tostring(i)}
            end
            live[round] = {id = round}
        end
        local sum = 0
        for i = 1, 50 do sum = sum + live[i].id end
        return sum
    "#);
    assert_eq!(out, ["1275"]);
}

#[test]
fn interned_strings_resurrect_on_reuse() {
    // A condemned short string re-requested between mark and sweep must
    // come back identical, not duplicated.
    let out = run(r#"
        for i = 1, 100 do
            local s = "ephemeral-" .. i
        end
        collectgarbage("collect")
        local a = "ephemeral-" .. 1
        local b = "ephemeral-" .. 1
        return a == b
    "#);
    assert_eq!(out, ["true"]);
}
