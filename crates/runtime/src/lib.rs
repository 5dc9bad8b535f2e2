//! Selune Runtime: register VM, garbage collector, and embedding API
//!
//! One `Runtime` is one interpreter instance: a garbage-collected heap
//! of tagged values, a register-based bytecode VM, stackful
//! coroutines, and a C-style operand-stack API for the host.
//!
//! Key design decisions:
//! - Values are `Copy` tagged enums; collectable payloads are
//!   generational indices into the heap, never pointers
//! - All stack references are indices, so stack growth never
//!   invalidates frames or upvalues
//! - Nonlocal transfer (errors, yields) is `Result` + `?`
//!
//! # Modules
//!
//! - `value`: tagged values and type queries
//! - `heap`: the slot heap with typed generational handles
//! - `lstr`: string interning and the API string cache
//! - `table`: hybrid array+hash tables
//! - `func`: prototypes, closures, shared upvalue cells
//! - `meta`: metamethod events and absence caching
//! - `ops`: arithmetic/comparison/concat/index with metamethods
//! - `gc`: incremental tri-color collection
//! - `state`: global state, threads, call frames
//! - `call`: call setup, protected calls, upvalue lifecycle
//! - `vm`: the dispatch loop
//! - `coroutine`: resume/yield with continuations
//! - `load`: chunk loading and dumping
//! - `api`: the host embedding surface
//! - `ldebug`: introspection, tracebacks, error messages
//! - `corelib`: the minimal embedded base library

pub mod api;
pub mod call;
pub mod coroutine;
pub mod corelib;
pub mod error;
pub mod func;
pub mod gc;
pub mod heap;
pub mod ldebug;
pub mod load;
pub mod lstr;
pub mod meta;
pub mod ops;
pub mod state;
pub mod table;
pub mod value;
pub mod vm;

pub use api::{GcOp, REGISTRY_INDEX, upvalue_index};
pub use coroutine::CoStatus;
pub use error::{Control, RtError, RtResult, Status};
pub use heap::{StrRef, TableRef, ThreadRef};
pub use state::{HookEvent, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RET, Runtime};
pub use value::{NativeFn, Type, Value};

use selune_core::limits::MULTRET;

impl Runtime {
    /// Convenience bootstrap: a runtime with the core library open.
    pub fn with_corelib() -> Box<Runtime> {
        let mut rt = Runtime::new();
        corelib::open_libs(&mut rt).expect("library registration cannot fail on a fresh state");
        rt
    }

    /// Load and run `source` protected, returning the produced values
    /// count or the error message.
    pub fn do_string(&mut self, source: &[u8], chunk_name: &str) -> Result<usize, String> {
        let base_top = self.get_top();
        let status = self.load_buffer(source, chunk_name.as_bytes(), "bt");
        if status != Status::Ok {
            let msg = self.to_rust_string(-1).unwrap_or_else(|| "unknown error".into());
            self.pop(1);
            return Err(msg);
        }
        let status = self.pcall(0, MULTRET, 0);
        if status != Status::Ok {
            let msg = self.to_rust_string(-1).unwrap_or_else(|| "unknown error".into());
            self.pop(1);
            return Err(msg);
        }
        Ok(self.get_top() - base_top)
    }
}
