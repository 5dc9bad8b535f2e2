//! Selune Core: bytecode and function-prototype foundation
//!
//! This crate holds everything the compiler and the runtime must agree on
//! without either depending on the other's internals:
//!
//! - `opcode`: the 32-bit instruction word, field encoding, and the
//!   47-opcode table with per-opcode format metadata
//! - `proto`: the compiler-output function shape (`ProtoDesc`) with its
//!   constant pool, upvalue descriptors, and debug records
//! - `numeric`: string↔number conversions shared by the lexer and the
//!   runtime's coercion rules
//! - `chunk`: the bit-exact binary chunk writer/reader (`dump`/`undump`)
//! - `limits`: stack, register, and nesting bounds
//!
//! No heap, no I/O, no interpreter state lives here.

pub mod chunk;
pub mod limits;
pub mod numeric;
pub mod opcode;
pub mod proto;

pub use chunk::{ChunkError, dump_chunk, undump_chunk};
pub use opcode::{Instruction, OpCode, OpMode};
pub use proto::{Constant, LocVar, ProtoDesc, UpvalDesc};
