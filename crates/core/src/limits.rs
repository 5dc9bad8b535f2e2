//! Global bounds shared by the compiler and the runtime.

/// Maximum number of operand-stack slots a thread may grow to.
pub const MAX_STACK: usize = 1_000_000;

/// Extra slots kept usable while an error handler runs after a stack
/// overflow has already been reported.
pub const ERROR_STACK_EXTRA: usize = 200;

/// Basic stack headroom every call is guaranteed.
pub const MIN_STACK: usize = 20;

/// Extra slots reserved beyond `top` for metamethod scratch space.
pub const EXTRA_STACK: usize = 5;

/// Maximum registers addressable by one function (8-bit A operand, with
/// the top value reserved as the "no register" marker).
pub const MAX_REGS: u32 = 255;

/// Register count at which the code generator refuses to allocate more.
pub const MAX_LOCALS: u32 = 200;

/// Maximum upvalues per function (fits the B operand of GETUPVAL).
pub const MAX_UPVALUES: u32 = 255;

/// Nesting depth bound for the parser (syntactic levels).
pub const MAX_PARSER_DEPTH: u32 = 200;

/// Reentrant native-call depth bound per thread.
pub const MAX_NATIVE_CALLS: u32 = 200;

/// Length at or below which strings are interned.
pub const SHORT_STRING_MAX: usize = 40;

/// Bound on `__index`/`__newindex` chain walks before the runtime reports
/// a loop.
pub const MAX_META_CHAIN: u32 = 2000;

/// `nresults` encoding for "as many results as produced".
pub const MULTRET: i32 = -1;
