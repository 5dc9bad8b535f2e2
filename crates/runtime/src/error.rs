//! Runtime status codes and nonlocal control transfer.
//!
//! Internally every fallible path returns `Result<T, Control>`; the `?`
//! operator is the unwind mechanism. A `Control::Error` carries the
//! thrown error value and its status kind until the nearest protected
//! call deposits it on the stack. `Control::Yield` unwinds only through
//! yieldable frames, back to the `resume` that started them.

use crate::value::Value;

/// Thread and call status codes, also used as error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Yield,
    /// Runtime error (type errors, `error()`, arithmetic on
    /// non-numbers, stack overflow).
    ErrRun,
    /// Compile failure.
    ErrSyntax,
    /// Allocation failure.
    ErrMem,
    /// A `__gc` finalizer raised.
    ErrGcMm,
    /// The error handler itself raised.
    ErrErr,
    /// File access failure in a loader.
    ErrFile,
}

impl Status {
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }
}

/// A thrown error: its kind plus the error object (usually a string,
/// but any value thrown by `error()`).
#[derive(Debug, Clone, Copy)]
pub struct RtError {
    pub status: Status,
    pub value: Value,
}

/// Nonlocal transfer unwinding the Rust call stack.
#[derive(Debug, Clone, Copy)]
pub enum Control {
    /// Unwind to the innermost resume; the yielded values were already
    /// staged on the yielding thread's stack.
    Yield,
    Error(RtError),
}

impl Control {
    pub fn error(status: Status, value: Value) -> Control {
        Control::Error(RtError { status, value })
    }
}

pub type RtResult<T> = Result<T, Control>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_classification() {
        assert!(!Status::Ok.is_error());
        assert!(!Status::Yield.is_error());
        for s in [Status::ErrRun, Status::ErrSyntax, Status::ErrMem, Status::ErrGcMm, Status::ErrErr]
        {
            assert!(s.is_error());
        }
    }
}
