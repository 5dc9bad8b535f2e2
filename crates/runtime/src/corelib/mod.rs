//! Minimal embedded library: the base functions and the coroutine
//! table, implemented purely against the host API. Everything here
//! could live outside the runtime crate; it is bundled because the
//! interpreter is not usable from scripts without `pcall`, `error`,
//! `setmetatable`, and friends.

mod base;
mod coro;

use crate::error::RtResult;
use crate::state::Runtime;

/// Register the base functions and the `coroutine` table into the
/// globals.
pub fn open_libs(rt: &mut Runtime) -> RtResult<()> {
    base::open(rt)?;
    coro::open(rt)?;
    Ok(())
}
