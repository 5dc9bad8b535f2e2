//! Incremental tri-color garbage collector.
//!
//! Phases run in a fixed order, driven by allocation debt:
//! `pause → propagate → (atomic) → sweep allgc → sweep finobj →
//! sweep tobefnz → sweep end → call finalizers → pause`.
//!
//! Two white bits alternate between cycles: objects allocated during a
//! cycle wear the *current* white and survive the cycle's sweep; the
//! sweep frees objects wearing the *other* white. Between steps the
//! tri-color invariant holds — no black object refers to a white one —
//! preserved by a forward barrier (mark the child) on most containers
//! and a backward barrier (regray the parent) on tables.
//!
//! Weak tables are parked on side lists during marking and processed
//! in the atomic phase; ephemerons (weak keys) converge by repeated
//! passes. Unreachable objects with a `__gc` metamethod are separated,
//! resurrected for finalization, and finalized one batch per step.

use tracing::{debug, trace};

use crate::error::{Control, RtResult, Status};
use crate::func::{UpvalRef, upval_is_open};
use crate::heap::{FIXED, GcRef, ObjData, TableRef, ThreadRef, WHITE_BITS, WHITE0};
use crate::meta::Tm;
use crate::state::{CallFlags, Runtime};
use crate::table::{NodeKey, Table};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pause,
    Propagate,
    SweepAllGc,
    SweepFinObj,
    SweepToBeFnz,
    SweepEnd,
    CallFin,
}

/// Work-unit tuning, in byte-sized units.
const STEP_SIZE: isize = 2400;
const STEP_MUL_ADJ: isize = 200;
const PAUSE_ADJ: usize = 100;
const SWEEP_MAX: usize = 80;
const MAX_FIN_BATCH: usize = 8;

pub struct GcState {
    pub phase: Phase,
    pub current_white: u8,
    pub running: bool,
    /// Reentrancy guard: a step never starts while another runs.
    pub stepping: bool,
    /// Emergency collections skip finalizers and shrinking.
    pub emergency: bool,
    /// Pause between cycles, percent of the live estimate.
    pub pause: u32,
    /// Work per allocation unit, percent.
    pub stepmul: u32,
    /// Live-byte estimate at the end of the last mark.
    pub estimate: usize,
    /// Traversal work counter for the current stretch.
    pub memtrav: usize,

    // Object lists (intrusive through headers).
    pub allgc: Option<GcRef>,
    pub finobj: Option<GcRef>,
    pub tobefnz: Option<GcRef>,

    // Mark worklists.
    pub gray: Vec<GcRef>,
    pub grayagain: Vec<GcRef>,
    pub weak: Vec<TableRef>,
    pub ephemeron: Vec<TableRef>,
    pub allweak: Vec<TableRef>,

    /// Sweep cursor: last surviving object of the list being swept;
    /// `None` means the list head is next.
    sweep_cursor: Option<GcRef>,
    pub inside_atomic: bool,
    /// Finalizers run per CallFin step; doubles adaptively.
    pub gcfinnum: usize,
}

impl GcState {
    pub fn new() -> GcState {
        GcState {
            phase: Phase::Pause,
            current_white: WHITE0,
            running: true,
            stepping: false,
            emergency: false,
            pause: 200,
            stepmul: 200,
            estimate: 0,
            memtrav: 0,
            allgc: None,
            finobj: None,
            tobefnz: None,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            sweep_cursor: None,
            inside_atomic: false,
            gcfinnum: 1,
        }
    }

    pub fn other_white(&self) -> u8 {
        WHITE_BITS & !self.current_white
    }

    /// True while the tri-color invariant must be preserved by
    /// barriers.
    pub fn keep_invariant(&self) -> bool {
        self.phase == Phase::Propagate || self.inside_atomic
    }

    pub fn in_sweep(&self) -> bool {
        matches!(
            self.phase,
            Phase::SweepAllGc | Phase::SweepFinObj | Phase::SweepToBeFnz | Phase::SweepEnd
        )
    }
}

impl Default for GcState {
    fn default() -> GcState {
        GcState::new()
    }
}

// ======================================================================
// Marking
// ======================================================================

fn mark_value(rt: &mut Runtime, v: &Value) {
    if let Some(r) = v.gc_ref() {
        mark_object(rt, r);
    }
}

/// Turn a white object gray (queued) or black (leaf).
pub fn mark_object(rt: &mut Runtime, r: GcRef) {
    let header = rt.heap.header(r);
    if !header.is_white() {
        return;
    }
    match &rt.heap.get(r).data {
        ObjData::Str(_) => {
            let size = rt.heap.get(r).size();
            rt.heap.header_mut(r).make_black();
            rt.gc.memtrav += size;
        }
        ObjData::Userdata(_) => {
            // Userdata has no gray phase: mark its two references now.
            let (mt, uv) = {
                let u = match &rt.heap.get(r).data {
                    ObjData::Userdata(u) => u,
                    _ => unreachable!(),
                };
                (u.metatable, u.user_value)
            };
            let size = rt.heap.get(r).size();
            rt.heap.header_mut(r).make_black();
            rt.gc.memtrav += size;
            if let Some(mt) = mt {
                mark_object(rt, mt.0);
            }
            mark_value(rt, &uv);
        }
        _ => {
            rt.heap.header_mut(r).make_gray();
            rt.gc.gray.push(r);
        }
    }
}

/// A weak-table entry is cleared when it refers to a white object.
/// String keys/values are values, not references: they get marked
/// instead of cleared.
fn is_cleared(rt: &mut Runtime, v: &Value) -> bool {
    match v {
        Value::Str(s) => {
            mark_object(rt, s.0);
            false
        }
        other => match other.gc_ref() {
            Some(r) => rt.heap.header(r).is_white(),
            None => false,
        },
    }
}

fn propagate_one(rt: &mut Runtime) -> usize {
    let r = rt.gc.gray.pop().expect("caller checked");
    if !rt.heap.header(r).is_gray() {
        return 0; // already traversed through another path
    }
    rt.heap.header_mut(r).make_black();
    let before = rt.gc.memtrav;
    match &rt.heap.get(r).data {
        ObjData::Table(_) => traverse_table(rt, TableRef(r)),
        ObjData::Closure(_) => traverse_lclosure(rt, r),
        ObjData::NativeClosure(_) => traverse_nclosure(rt, r),
        ObjData::Proto(_) => traverse_proto(rt, r),
        ObjData::Thread(_) => {
            if !rt.gc.inside_atomic {
                // Threads stay gray and are revisited in the atomic
                // phase: their stacks mutate without barriers.
                rt.heap.header_mut(r).make_gray();
                rt.gc.grayagain.push(r);
            }
            traverse_thread(rt, ThreadRef(r));
        }
        ObjData::Str(_) | ObjData::Userdata(_) => unreachable!("leaves are never gray"),
    }
    let obj_size = rt.heap.get(r).size();
    rt.gc.memtrav += obj_size;
    rt.gc.memtrav - before
}

/// Weak mode of a table, from its metatable's `__mode` field. Read
/// while the table is still in its slot, so a table serving as its own
/// metatable resolves correctly.
fn table_weak_mode(rt: &mut Runtime, tref: TableRef) -> (bool, bool) {
    let Some(mt) = rt.heap.table(tref).metatable else { return (false, false) };
    let seed = rt.strings.seed;
    let mode = crate::meta::fast_tm(&mut rt.heap, seed, &rt.tm_names, mt, Tm::Mode);
    if let Value::Str(s) = mode {
        let bytes = rt.heap.str(s).bytes.clone();
        (bytes.contains(&b'k'), bytes.contains(&b'v'))
    } else {
        (false, false)
    }
}

fn traverse_table(rt: &mut Runtime, tref: TableRef) {
    let (weak_k, weak_v) = table_weak_mode(rt, tref);
    let mut t = rt.heap.take_table(tref);
    if let Some(mt) = t.metatable {
        mark_object(rt, mt.0);
    }
    match (weak_k, weak_v) {
        (false, false) => traverse_strong_table(rt, &mut t),
        (false, true) => {
            traverse_weak_value_table(rt, &mut t, tref);
        }
        (true, false) => {
            traverse_ephemeron_table(rt, &mut t, tref);
        }
        (true, true) => {
            rt.gc.allweak.push(tref);
        }
    }
    rt.heap.put_table(tref, t);
    if weak_k || weak_v {
        // Weak tables are revisited atomically; keep them gray.
        rt.heap.header_mut(tref.0).make_gray();
    }
}

fn tombstone_if_collectable(node_key: &mut NodeKey) {
    if let NodeKey::Live(k) = *node_key {
        if k.is_collectable() {
            *node_key = NodeKey::Dead(k);
        }
    }
}

fn traverse_strong_table(rt: &mut Runtime, t: &mut Table) {
    for v in &t.array {
        mark_value(rt, v);
    }
    for node in &mut t.nodes {
        if node.value.is_nil() {
            tombstone_if_collectable(&mut node.key);
        } else if let NodeKey::Live(k) = node.key {
            mark_value(rt, &k);
            let v = node.value;
            mark_value(rt, &v);
        }
    }
}

fn traverse_weak_value_table(rt: &mut Runtime, t: &mut Table, tref: TableRef) {
    let mut has_clears = !t.array.is_empty();
    for node in &mut t.nodes {
        if node.value.is_nil() {
            tombstone_if_collectable(&mut node.key);
        } else if let NodeKey::Live(k) = node.key {
            mark_value(rt, &k);
            let v = node.value;
            if !has_clears && is_cleared(rt, &v) {
                has_clears = true;
            }
        }
    }
    if rt.gc.phase == Phase::Propagate && !rt.gc.inside_atomic {
        rt.gc.grayagain.push(tref.0);
    } else if has_clears {
        rt.gc.weak.push(tref);
    }
}

/// Weak-key traversal. Returns true when it marked a value (the
/// ephemeron convergence signal).
fn traverse_ephemeron_table(rt: &mut Runtime, t: &mut Table, tref: TableRef) -> bool {
    let mut marked = false;
    let mut has_clears = false;
    let mut has_ww = false;
    for v in &t.array {
        if v.gc_ref().is_some_and(|r| rt.heap.header(r).is_white()) {
            marked = true;
            mark_value(rt, v);
        }
    }
    for node in &mut t.nodes {
        if node.value.is_nil() {
            tombstone_if_collectable(&mut node.key);
            continue;
        }
        let NodeKey::Live(k) = node.key else { continue };
        let v = node.value;
        if is_cleared(rt, &k) {
            has_clears = true;
            if v.gc_ref().is_some_and(|r| rt.heap.header(r).is_white()) {
                has_ww = true;
            }
        } else if v.gc_ref().is_some_and(|r| rt.heap.header(r).is_white()) {
            marked = true;
            mark_value(rt, &v);
        }
    }
    if rt.gc.phase == Phase::Propagate && !rt.gc.inside_atomic {
        rt.gc.grayagain.push(tref.0);
    } else if has_ww {
        rt.gc.ephemeron.push(tref);
    } else if has_clears {
        rt.gc.allweak.push(tref);
    }
    marked
}

fn traverse_lclosure(rt: &mut Runtime, r: GcRef) {
    let (proto, upvals) = {
        let c = match &rt.heap.get(r).data {
            ObjData::Closure(c) => c,
            _ => unreachable!(),
        };
        (c.proto, c.upvals.clone())
    };
    mark_object(rt, proto.0);
    for uv in &upvals {
        mark_upvalue(rt, uv);
    }
}

/// Open upvalues of still-running threads are deferred to the atomic
/// remark; everything else is marked through the cell now.
fn mark_upvalue(rt: &mut Runtime, uv: &UpvalRef) {
    if upval_is_open(uv) && !rt.gc.inside_atomic {
        uv.touched.set(true);
    } else {
        let v = crate::func::upval_get(&rt.heap, uv);
        mark_value(rt, &v);
    }
}

fn traverse_nclosure(rt: &mut Runtime, r: GcRef) {
    let upvals = match &rt.heap.get(r).data {
        ObjData::NativeClosure(c) => c.upvals.clone(),
        _ => unreachable!(),
    };
    for v in &upvals {
        mark_value(rt, v);
    }
}

fn traverse_proto(rt: &mut Runtime, r: GcRef) {
    let (constants, protos, source, loc_names, up_names) = {
        let p = match &rt.heap.get(r).data {
            ObjData::Proto(p) => p,
            _ => unreachable!(),
        };
        (
            p.constants.clone(),
            p.protos.clone(),
            p.source,
            p.loc_vars.iter().filter_map(|lv| lv.name).collect::<Vec<_>>(),
            p.upvalue_names.iter().flatten().copied().collect::<Vec<_>>(),
        )
    };
    for k in &constants {
        mark_value(rt, k);
    }
    for sub in protos {
        mark_object(rt, sub.0);
    }
    if let Some(s) = source {
        mark_object(rt, s.0);
    }
    for s in loc_names.into_iter().chain(up_names) {
        mark_object(rt, s.0);
    }
}

fn traverse_thread(rt: &mut Runtime, tref: ThreadRef) {
    let th = rt.heap.take_thread(tref);
    for v in &th.stack[..th.top] {
        mark_value(rt, v);
    }
    if rt.gc.inside_atomic {
        // Dead part of the stack must hold no references.
        let mut th = th;
        for v in &mut th.stack[th.top..] {
            *v = Value::Nil;
        }
        if !th.open_upvals.is_empty() && !rt.twups.contains(&tref) {
            rt.twups.push(tref);
        }
        rt.heap.put_thread(tref, th);
        return;
    }
    rt.heap.put_thread(tref, th);
}

fn propagate_all(rt: &mut Runtime) {
    while !rt.gc.gray.is_empty() {
        propagate_one(rt);
    }
}

// ======================================================================
// Write barriers
// ======================================================================

/// Forward barrier: a black `parent` gained a reference to white
/// `child`.
pub fn barrier_forward(rt: &mut Runtime, parent: GcRef, child: GcRef) {
    if rt.heap.header(parent).is_black() && rt.heap.header(child).is_white() {
        if rt.gc.keep_invariant() {
            mark_object(rt, child);
        } else {
            debug_assert!(rt.gc.in_sweep() || rt.gc.phase == Phase::Pause || rt.gc.phase == Phase::CallFin);
            let white = rt.gc.current_white;
            rt.heap.header_mut(parent).make_white(white);
        }
    }
}

/// Forward barrier taking the child as a value (non-collectable
/// children need no barrier).
pub fn barrier_forward_value(rt: &mut Runtime, parent: GcRef, child: &Value) {
    if let Some(c) = child.gc_ref() {
        barrier_forward(rt, parent, c);
    }
}

/// Backward barrier for tables: regray the container so it is
/// retraversed.
pub fn barrier_back(rt: &mut Runtime, t: TableRef) {
    if rt.heap.header(t.0).is_black() {
        rt.heap.header_mut(t.0).make_gray();
        rt.gc.grayagain.push(t.0);
    }
}

/// Barrier hook for raw table writes.
pub fn barrier_back_table(rt: &mut Runtime, t: TableRef, value: &Value, key: &Value) {
    if value.is_collectable() || key.is_collectable() {
        barrier_back(rt, t);
    }
}

/// Barrier for writes through a closed upvalue cell.
pub fn barrier_upvalue(rt: &mut Runtime, uv: &UpvalRef, v: &Value) {
    if upval_is_open(uv) {
        return; // stacks need no barriers (threads stay gray)
    }
    if rt.gc.keep_invariant() {
        if let Some(r) = v.gc_ref() {
            mark_object(rt, r);
        }
    }
}

// ======================================================================
// Atomic phase
// ======================================================================

fn mark_roots(rt: &mut Runtime) {
    rt.gc.gray.clear();
    rt.gc.grayagain.clear();
    rt.gc.weak.clear();
    rt.gc.ephemeron.clear();
    rt.gc.allweak.clear();
    let main = rt.main_thread;
    mark_object(rt, main.0);
    let reg = rt.registry;
    mark_object(rt, reg.0);
    for mt in rt.metatables.into_iter().flatten() {
        mark_object(rt, mt.0);
    }
}

fn remark_upvalues(rt: &mut Runtime) {
    let twups = std::mem::take(&mut rt.twups);
    for tref in twups {
        if !rt.heap.contains(tref.0) {
            continue;
        }
        let keep = rt.heap.header(tref.0).is_gray() && !rt.heap.thread(tref).open_upvals.is_empty();
        if keep {
            rt.twups.push(tref);
        } else {
            let upvals: Vec<UpvalRef> = rt
                .heap
                .thread(tref)
                .open_upvals
                .iter()
                .map(|(_, uv)| uv.clone())
                .collect();
            for uv in upvals {
                if uv.touched.replace(false) {
                    let v = crate::func::upval_get(&rt.heap, &uv);
                    mark_value(rt, &v);
                }
            }
        }
    }
}

fn converge_ephemerons(rt: &mut Runtime) {
    loop {
        let mut changed = false;
        let list = std::mem::take(&mut rt.gc.ephemeron);
        for tref in list {
            let mut t = rt.heap.take_table(tref);
            let marked = traverse_ephemeron_table(rt, &mut t, tref);
            rt.heap.put_table(tref, t);
            if marked {
                propagate_all(rt);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn clear_weak_values(rt: &mut Runtime, list: &[TableRef]) {
    for &tref in list {
        let mut t = rt.heap.take_table(tref);
        for i in 0..t.array.len() {
            let v = t.array[i];
            if !v.is_nil() && is_cleared(rt, &v) {
                t.array[i] = Value::Nil;
            }
        }
        for node in &mut t.nodes {
            if node.value.is_nil() {
                continue;
            }
            let v = node.value;
            if is_cleared(rt, &v) {
                node.value = Value::Nil;
                tombstone_if_collectable(&mut node.key);
            }
        }
        rt.heap.put_table(tref, t);
    }
}

fn clear_weak_keys(rt: &mut Runtime, list: &[TableRef]) {
    for &tref in list {
        let mut t = rt.heap.take_table(tref);
        for node in &mut t.nodes {
            if node.value.is_nil() {
                tombstone_if_collectable(&mut node.key);
                continue;
            }
            let k = match node.key {
                NodeKey::Live(k) => k,
                _ => continue,
            };
            if is_cleared(rt, &k) {
                node.value = Value::Nil;
                tombstone_if_collectable(&mut node.key);
            }
        }
        rt.heap.put_table(tref, t);
    }
}

/// Move unreachable finalizable objects from `finobj` to `tobefnz`
/// (append, preserving list order). With `all`, move everything
/// (runtime shutdown).
fn separate_tobefnz(rt: &mut Runtime, all: bool) {
    // Find the tail of tobefnz for appending.
    let mut tail: Option<GcRef> = rt.gc.tobefnz;
    while let Some(t) = tail {
        match rt.heap.header(t).next {
            Some(n) => tail = Some(n),
            None => break,
        }
    }
    let mut prev: Option<GcRef> = None;
    let mut cur = rt.gc.finobj;
    while let Some(r) = cur {
        let next = rt.heap.header(r).next;
        let dead = rt.heap.header(r).is_white();
        if !(dead || all) {
            prev = Some(r);
            cur = next;
            continue;
        }
        // Unlink from finobj.
        match prev {
            None => rt.gc.finobj = next,
            Some(p) => rt.heap.header_mut(p).next = next,
        }
        // Append to tobefnz.
        rt.heap.header_mut(r).next = None;
        match tail {
            None => rt.gc.tobefnz = Some(r),
            Some(t) => rt.heap.header_mut(t).next = Some(r),
        }
        tail = Some(r);
        cur = next;
    }
}

fn mark_being_finalized(rt: &mut Runtime) {
    let mut cur = rt.gc.tobefnz;
    while let Some(r) = cur {
        mark_object(rt, r);
        cur = rt.heap.header(r).next;
    }
}

fn atomic(rt: &mut Runtime) -> usize {
    rt.gc.inside_atomic = true;
    rt.gc.memtrav = 0;
    let grayagain = std::mem::take(&mut rt.gc.grayagain);

    let cur = rt.current;
    mark_object(rt, cur.0);
    let reg = rt.registry;
    mark_object(rt, reg.0);
    for mt in rt.metatables.into_iter().flatten() {
        mark_object(rt, mt.0);
    }
    remark_upvalues(rt);
    propagate_all(rt);
    let mut work = rt.gc.memtrav;

    rt.gc.gray = grayagain.into_iter().collect();
    propagate_all(rt);
    rt.gc.memtrav = 0;
    converge_ephemerons(rt);

    let weak_snapshot = rt.gc.weak.clone();
    let allweak_snapshot = rt.gc.allweak.clone();
    clear_weak_values(rt, &weak_snapshot);
    clear_weak_values(rt, &allweak_snapshot);
    let weak_len = rt.gc.weak.len();
    let allweak_len = rt.gc.allweak.len();
    work += rt.gc.memtrav;

    separate_tobefnz(rt, false);
    mark_being_finalized(rt);
    propagate_all(rt);
    rt.gc.memtrav = 0;
    converge_ephemerons(rt);

    let eph = rt.gc.ephemeron.clone();
    clear_weak_keys(rt, &eph);
    let allweak = rt.gc.allweak.clone();
    clear_weak_keys(rt, &allweak);
    // Resurrection may have appended new weak-value tables.
    let new_weak: Vec<TableRef> = rt.gc.weak[weak_len.min(rt.gc.weak.len())..].to_vec();
    let new_allweak: Vec<TableRef> = rt.gc.allweak[allweak_len.min(rt.gc.allweak.len())..].to_vec();
    clear_weak_values(rt, &new_weak);
    clear_weak_values(rt, &new_allweak);

    rt.strings.clear_cache();
    rt.gc.current_white = rt.gc.other_white();
    work += rt.gc.memtrav;
    rt.gc.inside_atomic = false;
    rt.gc.gray.clear();
    rt.gc.grayagain.clear();
    rt.gc.weak.clear();
    rt.gc.ephemeron.clear();
    rt.gc.allweak.clear();
    work
}

// ======================================================================
// Sweep
// ======================================================================

#[derive(Clone, Copy, PartialEq)]
enum SweepList {
    AllGc,
    FinObj,
    ToBeFnz,
}

fn sweep_head(rt: &Runtime, which: SweepList) -> Option<GcRef> {
    match which {
        SweepList::AllGc => rt.gc.allgc,
        SweepList::FinObj => rt.gc.finobj,
        SweepList::ToBeFnz => rt.gc.tobefnz,
    }
}

fn set_sweep_head(rt: &mut Runtime, which: SweepList, head: Option<GcRef>) {
    match which {
        SweepList::AllGc => rt.gc.allgc = head,
        SweepList::FinObj => rt.gc.finobj = head,
        SweepList::ToBeFnz => rt.gc.tobefnz = head,
    }
}

fn free_object(rt: &mut Runtime, r: GcRef) {
    if let ObjData::Str(s) = &rt.heap.get(r).data {
        if !s.long {
            rt.strings.remove(&mut rt.heap, r);
        }
    }
    if let ObjData::Thread(_) = &rt.heap.get(r).data {
        // Cells shared with surviving closures must absorb their stack
        // values before the stack disappears.
        crate::call::close_upvalues(rt, ThreadRef(r), 0);
        rt.twups.retain(|t| t.0 != r);
    }
    rt.heap.free(r);
}

/// Sweep up to `max` objects of the given list. Returns (work, done).
fn sweep_step(rt: &mut Runtime, which: SweepList, max: usize) -> (usize, bool) {
    let other = rt.gc.other_white();
    let white = rt.gc.current_white;
    let mut work = 0;
    for _ in 0..max {
        let cur = match rt.gc.sweep_cursor {
            None => sweep_head(rt, which),
            Some(prev) => rt.heap.header(prev).next,
        };
        let Some(r) = cur else {
            return (work, true);
        };
        let h = rt.heap.header(r);
        work += 32;
        if h.marked & other != 0 && h.marked & FIXED == 0 {
            let next = h.next;
            match rt.gc.sweep_cursor {
                None => set_sweep_head(rt, which, next),
                Some(prev) => rt.heap.header_mut(prev).next = next,
            }
            work += rt.heap.get(r).size();
            free_object(rt, r);
        } else {
            rt.heap.header_mut(r).make_white(white);
            rt.gc.sweep_cursor = Some(r);
        }
    }
    (work, false)
}

// ======================================================================
// Finalizers
// ======================================================================

/// Does `v` have a `__gc` metamethod and no FINALIZED mark yet? Then
/// move it from allgc to finobj so the collector watches it.
pub fn check_finalizer(rt: &mut Runtime, v: &Value) {
    let Some(r) = v.gc_ref() else { return };
    if rt.heap.header(r).marked & crate::heap::FINALIZED != 0 {
        return;
    }
    let gc_tm = rt.tm_of(v, Tm::Gc);
    if gc_tm.is_nil() {
        return;
    }
    // Unlink from allgc (linear walk, as rare as setmetatable-with-gc).
    let mut prev: Option<GcRef> = None;
    let mut cur = rt.gc.allgc;
    loop {
        match cur {
            None => return, // already separated (or a fixed object)
            Some(c) if c == r => break,
            Some(c) => {
                prev = Some(c);
                cur = rt.heap.header(c).next;
            }
        }
    }
    // If the sweep cursor sits on this object, restart that list's
    // sweep; resweeping repainted objects is harmless.
    if rt.gc.sweep_cursor == Some(r) {
        rt.gc.sweep_cursor = prev;
    }
    let next = rt.heap.header(r).next;
    match prev {
        None => rt.gc.allgc = next,
        Some(p) => rt.heap.header_mut(p).next = next,
    }
    let finobj = rt.gc.finobj;
    {
        let h = rt.heap.header_mut(r);
        h.next = finobj;
        h.marked |= crate::heap::FINALIZED;
    }
    rt.gc.finobj = Some(r);
}

/// Pop one object from tobefnz back into allgc and run its finalizer
/// in a protected call. Errors surface as `ErrGcMm`.
fn run_one_finalizer(rt: &mut Runtime, propagate_errors: bool) -> RtResult<()> {
    let Some(r) = rt.gc.tobefnz else { return Ok(()) };
    rt.gc.tobefnz = rt.heap.header(r).next;
    let allgc = rt.gc.allgc;
    {
        let h = rt.heap.header_mut(r);
        h.next = allgc;
        h.marked &= !crate::heap::FINALIZED;
    }
    rt.gc.allgc = Some(r);
    if rt.gc.in_sweep() {
        let white = rt.gc.current_white;
        rt.heap.header_mut(r).make_white(white);
    }
    let v = ref_to_value(rt, r);
    let tm = rt.tm_of(&v, Tm::Gc);
    if tm.is_nil() {
        return Ok(());
    }
    let was_running = rt.gc.running;
    rt.gc.running = false;
    let allow = rt.th().allow_hook;
    rt.th_mut().allow_hook = false;
    rt.th_mut().frame_mut().flags |= CallFlags::FIN;

    let result = crate::call::protected_body(rt, |rt| {
        rt.push_value(tm)?;
        rt.push_value(v)?;
        let th = rt.th();
        let func = th.top - 2;
        crate::call::call_no_yield(rt, func, 0)
    });

    rt.th_mut().frame_mut().flags &= !CallFlags::FIN;
    rt.th_mut().allow_hook = allow;
    rt.gc.running = was_running;
    if let Err(err) = result {
        if propagate_errors {
            let mapped = match err {
                Control::Error(e) if e.status == Status::ErrRun => {
                    let base = rt
                        .describe_value(e.value)
                        .unwrap_or_else(|| "no message".into());
                    let msg = rt.new_string_value(&format!("error in __gc metamethod ({base})"));
                    Control::error(Status::ErrGcMm, msg)
                }
                other => other,
            };
            return Err(mapped);
        }
        // Contained: drop the staged error object and report it out of
        // band, since an allocation-triggered step cannot unwind.
        if let Control::Error(e) = err {
            let msg = rt.describe_value(e.value).unwrap_or_else(|| "non-string error".into());
            debug!(target: "selune::gc", error = %msg, "error in __gc metamethod ignored");
        }
        let th = rt.th_mut();
        th.top = th.top.saturating_sub(1);
    }
    Ok(())
}

fn ref_to_value(rt: &Runtime, r: GcRef) -> Value {
    match &rt.heap.get(r).data {
        ObjData::Table(_) => Value::Table(TableRef(r)),
        ObjData::Userdata(_) => Value::Userdata(crate::heap::UdRef(r)),
        ObjData::Str(_) => Value::Str(crate::heap::StrRef(r)),
        ObjData::Closure(_) => Value::Closure(crate::heap::ClosureRef(r)),
        ObjData::NativeClosure(_) => Value::NativeClosure(crate::heap::NativeClosRef(r)),
        ObjData::Thread(_) => Value::Thread(ThreadRef(r)),
        ObjData::Proto(_) => unreachable!("protos are not first-class"),
    }
}

fn pending_finalizers(rt: &Runtime) -> bool {
    rt.gc.tobefnz.is_some()
}

// ======================================================================
// The step machine
// ======================================================================

fn single_step(rt: &mut Runtime) -> usize {
    match rt.gc.phase {
        Phase::Pause => {
            rt.gc.memtrav = 0;
            mark_roots(rt);
            rt.gc.phase = Phase::Propagate;
            trace!(target: "selune::gc", "cycle start");
            rt.gc.memtrav
        }
        Phase::Propagate => {
            if rt.gc.gray.is_empty() {
                let work = atomic(rt);
                rt.gc.estimate = rt.heap.total_bytes;
                rt.gc.phase = Phase::SweepAllGc;
                rt.gc.sweep_cursor = None;
                work
            } else {
                propagate_one(rt)
            }
        }
        Phase::SweepAllGc => {
            let (work, done) = sweep_step(rt, SweepList::AllGc, SWEEP_MAX);
            if done {
                rt.gc.phase = Phase::SweepFinObj;
                rt.gc.sweep_cursor = None;
            }
            work
        }
        Phase::SweepFinObj => {
            let (work, done) = sweep_step(rt, SweepList::FinObj, SWEEP_MAX);
            if done {
                rt.gc.phase = Phase::SweepToBeFnz;
                rt.gc.sweep_cursor = None;
            }
            work
        }
        Phase::SweepToBeFnz => {
            let (work, done) = sweep_step(rt, SweepList::ToBeFnz, SWEEP_MAX);
            if done {
                rt.gc.phase = Phase::SweepEnd;
                rt.gc.sweep_cursor = None;
            }
            work
        }
        Phase::SweepEnd => {
            if !rt.gc.emergency {
                rt.strings.shrink_if_sparse(&mut rt.heap);
            }
            rt.gc.phase =
                if pending_finalizers(rt) { Phase::CallFin } else { Phase::Pause };
            debug!(
                target: "selune::gc",
                live = rt.heap.live_objects(),
                bytes = rt.heap.total_bytes,
                "sweep finished"
            );
            0
        }
        Phase::CallFin => {
            if pending_finalizers(rt) && !rt.gc.emergency {
                let n = rt.gc.gcfinnum.min(MAX_FIN_BATCH);
                rt.gc.gcfinnum = (rt.gc.gcfinnum * 2).min(MAX_FIN_BATCH);
                let mut work = 0;
                for _ in 0..n {
                    if !pending_finalizers(rt) {
                        break;
                    }
                    // Finalizer errors inside a step are reported
                    // through the panic path by the caller of step();
                    // here they are contained.
                    let _ = run_one_finalizer(rt, false);
                    work += 100;
                }
                if pending_finalizers(rt) {
                    return work;
                }
                rt.gc.phase = Phase::Pause;
                rt.gc.gcfinnum = 1;
                work
            } else {
                rt.gc.phase = Phase::Pause;
                rt.gc.gcfinnum = 1;
                0
            }
        }
    }
}

fn set_pause(rt: &mut Runtime) {
    let estimate = (rt.gc.estimate / PAUSE_ADJ).max(1);
    let threshold = estimate.saturating_mul(rt.gc.pause as usize);
    let debt = rt.heap.total_bytes as isize - threshold as isize;
    rt.heap.debt = debt;
    trace!(target: "selune::gc", debt, threshold, "pause set");
}

/// One incremental collection step, paying off allocation debt.
pub fn step(rt: &mut Runtime) {
    if rt.gc.stepping {
        return;
    }
    rt.gc.stepping = true;
    let stepmul = (rt.gc.stepmul.max(40)) as isize;
    let mut debt = rt.heap.debt;
    debt = debt / STEP_MUL_ADJ + 1;
    debt = debt.saturating_mul(stepmul);
    loop {
        let work = single_step(rt) as isize;
        debt -= work;
        if debt <= -STEP_SIZE || rt.gc.phase == Phase::Pause {
            break;
        }
    }
    if rt.gc.phase == Phase::Pause {
        set_pause(rt);
    } else {
        rt.heap.debt = (debt / stepmul) * STEP_MUL_ADJ;
    }
    rt.gc.stepping = false;
}

/// Run until the collector reaches `phase`.
fn run_until(rt: &mut Runtime, phase: Phase) {
    while rt.gc.phase != phase {
        single_step(rt);
    }
}

/// A complete collection cycle. Emergency collections skip finalizers
/// and shrinking.
pub fn full_gc(rt: &mut Runtime, emergency: bool) {
    if rt.gc.stepping {
        return;
    }
    rt.gc.stepping = true;
    rt.gc.emergency = emergency;
    if rt.gc.keep_invariant() {
        // Abort the current mark: sweep everything back to white.
        rt.gc.phase = Phase::SweepAllGc;
        rt.gc.sweep_cursor = None;
        rt.gc.gray.clear();
        rt.gc.grayagain.clear();
    }
    run_until(rt, Phase::Pause);
    // One full fresh cycle.
    single_step(rt); // pause -> propagate
    run_until(rt, Phase::Pause);
    rt.gc.emergency = false;
    set_pause(rt);
    rt.gc.stepping = false;
    debug!(target: "selune::gc", bytes = rt.heap.total_bytes, "full collection done");
}

/// Run every pending finalizer (shutdown or explicit collect).
pub fn finish_finalizers(rt: &mut Runtime) {
    separate_tobefnz(rt, true);
    mark_being_finalized(rt);
    while pending_finalizers(rt) {
        let _ = run_one_finalizer(rt, false);
    }
}
