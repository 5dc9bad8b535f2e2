//! Chunk loading and dumping.
//!
//! `load_chunk` accepts source text or a precompiled binary chunk
//! (recognized by its escape byte) subject to a mode string, compiles
//! or undumps it, instantiates heap prototypes, and wraps the main
//! function in a closure whose first upvalue is bound to the globals
//! table.

use tracing::debug;

use selune_core::chunk;
use selune_core::proto::{Constant, ProtoDesc};

use crate::error::{Control, RtResult, Status};
use crate::func::{LClosure, LocVarRt, Proto, new_closed_upval};
use crate::heap::{ClosureRef, ProtoRef};
use crate::state::Runtime;
use crate::value::Value;

/// First byte of a binary chunk.
const CHUNK_ESCAPE: u8 = 0x1B;

/// Instantiate a compiled description as heap prototypes, interning
/// every string once.
pub fn desc_to_proto(rt: &mut Runtime, desc: &ProtoDesc) -> ProtoRef {
    let constants = desc
        .constants
        .iter()
        .map(|k| match k {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(rt.new_string(s)),
        })
        .collect();
    let protos = desc.protos.iter().map(|p| desc_to_proto(rt, p)).collect();
    let loc_vars = desc
        .loc_vars
        .iter()
        .map(|lv| LocVarRt {
            name: Some(rt.new_string(&lv.name)),
            start_pc: lv.start_pc,
            end_pc: lv.end_pc,
        })
        .collect();
    let upvalue_names = desc
        .upvalues
        .iter()
        .enumerate()
        .map(|(i, _)| desc.upvalue_names.get(i).map(|n| rt.new_string(n)))
        .collect();
    let source = if desc.source.is_empty() {
        None
    } else {
        Some(rt.new_string(&desc.source))
    };
    rt.new_proto(Proto {
        num_params: desc.num_params,
        is_vararg: desc.is_vararg,
        max_stack_size: desc.max_stack_size,
        code: desc.code.clone(),
        constants,
        upvalues: desc.upvalues.clone(),
        protos,
        line_info: desc.line_info.clone(),
        loc_vars,
        upvalue_names,
        source,
        line_defined: desc.line_defined,
        last_line_defined: desc.last_line_defined,
    })
}

/// Convert a loaded prototype back to its description (for `dump`).
pub fn proto_to_desc(rt: &Runtime, pref: ProtoRef) -> ProtoDesc {
    let p = rt.heap.proto(pref);
    ProtoDesc {
        num_params: p.num_params,
        is_vararg: p.is_vararg,
        max_stack_size: p.max_stack_size,
        code: p.code.clone(),
        constants: p
            .constants
            .iter()
            .map(|v| match v {
                Value::Nil => Constant::Nil,
                Value::Bool(b) => Constant::Bool(*b),
                Value::Int(i) => Constant::Int(*i),
                Value::Float(f) => Constant::Float(*f),
                Value::Str(s) => Constant::Str(rt.str_bytes(*s).to_vec()),
                _ => unreachable!("constant pools hold only scalars and strings"),
            })
            .collect(),
        upvalues: p.upvalues.clone(),
        protos: p.protos.iter().map(|sub| proto_to_desc(rt, *sub)).collect(),
        line_info: p.line_info.clone(),
        loc_vars: p
            .loc_vars
            .iter()
            .map(|lv| selune_core::proto::LocVar {
                name: lv.name.map(|s| rt.str_bytes(s).to_vec()).unwrap_or_default(),
                start_pc: lv.start_pc,
                end_pc: lv.end_pc,
            })
            .collect(),
        upvalue_names: p
            .upvalue_names
            .iter()
            .map(|n| n.map(|s| rt.str_bytes(s).to_vec()).unwrap_or_default())
            .collect(),
        source: p.source.map(|s| rt.str_bytes(s).to_vec()).unwrap_or_default(),
        line_defined: p.line_defined,
        last_line_defined: p.last_line_defined,
    }
}

/// Load a chunk from bytes. `mode` limits accepted forms: `t` text,
/// `b` binary, `bt` both.
pub fn load_chunk(
    rt: &mut Runtime,
    source: &[u8],
    chunk_name: &[u8],
    mode: &str,
) -> RtResult<ClosureRef> {
    let desc = if source.first() == Some(&CHUNK_ESCAPE) {
        if !mode.contains('b') {
            return Err(syntax_error(
                rt,
                format!("attempt to load a binary chunk (mode is '{mode}')"),
            ));
        }
        match chunk::undump_chunk(source) {
            Ok(d) => d,
            Err(e) => return Err(syntax_error(rt, e.to_string())),
        }
    } else {
        if !mode.contains('t') {
            return Err(syntax_error(
                rt,
                format!("attempt to load a text chunk (mode is '{mode}')"),
            ));
        }
        match selune_compiler::compile(source, chunk_name) {
            Ok(d) => d,
            Err(e) => return Err(syntax_error(rt, e.to_string())),
        }
    };
    debug!(
        target: "selune::load",
        chunk = %String::from_utf8_lossy(chunk_name),
        instructions = desc.code.len(),
        "chunk loaded"
    );
    // The collector stays off while prototypes are under construction:
    // constants interned for a half-built proto have no heap anchor
    // yet.
    let was_running = rt.gc.running;
    rt.gc.running = false;
    let cl = instantiate(rt, &desc);
    rt.gc.running = was_running;
    Ok(cl)
}

/// Build the top-level closure: one closed cell per upvalue, the first
/// bound to the globals table.
fn instantiate(rt: &mut Runtime, desc: &ProtoDesc) -> ClosureRef {
    let proto = desc_to_proto(rt, desc);
    let nup = desc.upvalues.len();
    let mut upvals = Vec::with_capacity(nup);
    for i in 0..nup {
        let init = if i == 0 { Value::Table(rt.globals) } else { Value::Nil };
        upvals.push(new_closed_upval(init));
    }
    rt.new_lclosure(LClosure { proto, upvals })
}

/// Serialize the script function `cl` to a binary chunk.
pub fn dump_closure(rt: &Runtime, cl: ClosureRef, strip: bool) -> Vec<u8> {
    let desc = proto_to_desc(rt, rt.heap.closure(cl).proto);
    chunk::dump_chunk(&desc, strip)
}

fn syntax_error(rt: &mut Runtime, msg: String) -> Control {
    let v = rt.new_string_value(&msg);
    Control::error(Status::ErrSyntax, v)
}
