//! Code emitter: registers, constants, jump patch lists, expression
//! descriptors.
//!
//! The parser never touches instruction words directly; it drives this
//! emitter through expression descriptors. A descriptor names where a
//! value currently lives (constant, register, upvalue, table slot, the
//! result of a pending instruction) together with two patch lists `t`
//! and `f`: program counters of unresolved conditional jumps taken when
//! the expression is true or false. The lists stay open until the
//! expression's role is known, at which point they are patched to their
//! final targets, possibly via a LOADBOOL pair that materializes a
//! boolean.
//!
//! Register allocation is a stack frontier: `freereg` is the next free
//! slot and never drops below `nactvar`, the count of active locals.
//! Temporaries are freed in reverse allocation order.

use std::collections::HashMap;

use selune_core::limits::MAX_REGS;
use selune_core::numeric::{self, Number};
use selune_core::opcode::{
    Instruction, MAX_ARG_AX, MAX_ARG_BX, MAX_ARG_C, MAX_ARG_SBX, MAX_INDEX_RK, NO_JUMP, NO_REG,
    OpCode, is_k, rk_as_k,
};
use selune_core::proto::{Constant, ProtoDesc};

use crate::SyntaxError;

/// Binary operators in source precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// (left, right) binding powers. Right-associative operators bind
    /// weaker on their right side.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Ne | BinOp::Eq => (3, 3),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::BAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    fn arith_opcode(self) -> Option<OpCode> {
        Some(match self {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Div => OpCode::Div,
            BinOp::IDiv => OpCode::IDiv,
            BinOp::BAnd => OpCode::BAnd,
            BinOp::BOr => OpCode::BOr,
            BinOp::BXor => OpCode::BXor,
            BinOp::Shl => OpCode::Shl,
            BinOp::Shr => OpCode::Shr,
            _ => return None,
        })
    }
}

/// Unary operator precedence (binds tighter than every binary operator
/// except `^`).
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    BNot,
    Not,
    Len,
}

/// Where an expression's value currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpKind {
    Void,
    Nil,
    True,
    False,
    /// Constant-pool index.
    Const(u32),
    ConstFloat(f64),
    ConstInt(i64),
    /// Value is in a fixed register.
    NonReloc(u32),
    /// Value is the local variable in this register.
    Local(u32),
    /// Value is an upvalue.
    Upval(u32),
    /// Value is `obj[key]`; `key` is RK-encoded, `obj` is a register or
    /// an upvalue index.
    Indexed { obj: u32, key: u32, obj_is_upval: bool },
    /// Expression is a test; the payload is the pc of its jump.
    Jump(i32),
    /// Result of an emitted instruction whose A field is still open.
    Reloc(i32),
    /// Result of a CALL instruction at this pc.
    Call(i32),
    /// Result of a VARARG instruction at this pc.
    Vararg(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Patch list: jumps taken when the expression is true.
    pub t: i32,
    /// Patch list: jumps taken when the expression is false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> ExpDesc {
        ExpDesc { kind, t: NO_JUMP, f: NO_JUMP }
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// A compile-time numeric value with no pending jumps.
    fn as_numeral(&self) -> Option<Number> {
        if self.has_jumps() {
            return None;
        }
        match self.kind {
            ExpKind::ConstInt(i) => Some(Number::Int(i)),
            ExpKind::ConstFloat(f) => Some(Number::Float(f)),
            _ => None,
        }
    }
}

/// Constant-pool dedup key. Integers and floats are distinct keys even
/// when numerically equal, so `1` and `1.0` keep separate pool slots.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Vec<u8>),
}

/// Per-function compilation state: the prototype being built plus the
/// emitter bookkeeping around it.
pub struct FuncState {
    pub proto: ProtoDesc,
    /// Chunk name for error messages.
    pub chunk: String,
    /// Source line attributed to emitted instructions.
    pub line: u32,
    /// List of pending jumps to the next instruction.
    jpc: i32,
    /// Highest pc that is a jump target; instruction merging must not
    /// cross it.
    last_target: i32,
    pub freereg: u32,
    /// Count of active local variables.
    pub nactvar: u32,
    /// Active-variable stack: indices into `proto.loc_vars`. Entries at
    /// or beyond `nactvar` are declared but not yet in scope.
    pub actvar: Vec<usize>,
    const_map: HashMap<ConstKey, u32>,
}

impl FuncState {
    pub fn new(chunk: String, source: Vec<u8>) -> FuncState {
        FuncState {
            proto: ProtoDesc {
                source,
                max_stack_size: 2, // registers 0/1 are always valid
                ..ProtoDesc::default()
            },
            chunk,
            line: 0,
            jpc: NO_JUMP,
            last_target: 0,
            freereg: 0,
            nactvar: 0,
            actvar: Vec::new(),
            const_map: HashMap::new(),
        }
    }

    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    fn err<T>(&self, msg: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError::new(self.chunk.clone(), self.line, msg.into()))
    }

    // ==================================================================
    // Raw emission
    // ==================================================================

    fn emit(&mut self, ins: Instruction) -> i32 {
        self.discharge_jpc();
        self.proto.code.push(ins);
        self.proto.line_info.push(self.line);
        self.pc() - 1
    }

    pub fn code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> i32 {
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> i32 {
        self.emit(Instruction::abx(op, a, bx))
    }

    pub fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> i32 {
        self.emit(Instruction::asbx(op, a, sbx))
    }

    fn code_extraarg(&mut self, ax: u32) -> i32 {
        self.emit(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into `reg`, spilling to LOADKX + EXTRAARG when
    /// the index outgrows Bx.
    fn code_k(&mut self, reg: u32, k: u32) -> i32 {
        if k <= MAX_ARG_BX {
            self.code_abx(OpCode::LoadK, reg, k)
        } else {
            let pc = self.code_abx(OpCode::LoadKX, reg, 0);
            self.code_extraarg(k);
            pc
        }
    }

    /// Attribute the previous instruction to `line` instead of the
    /// current default.
    pub fn fix_line(&mut self, line: u32) {
        if let Some(last) = self.proto.line_info.last_mut() {
            *last = line;
        }
    }

    /// Emit a LOADNIL, merging into an adjacent previous one when no
    /// jump target separates them.
    pub fn nil(&mut self, from: u32, n: u32) {
        let l = from + n - 1;
        if self.pc() > self.last_target {
            if let Some(prev) = self.proto.code.last_mut() {
                if prev.opcode() == OpCode::LoadNil {
                    let pfrom = prev.a();
                    let pl = pfrom + prev.b();
                    if (pfrom <= from && from <= pl + 1) || (from <= pfrom && pfrom <= l + 1) {
                        let nfrom = pfrom.min(from);
                        let nl = pl.max(l);
                        prev.set_a(nfrom);
                        prev.set_b(nl - nfrom);
                        return;
                    }
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, n - 1, 0);
    }

    // ==================================================================
    // Registers
    // ==================================================================

    pub fn check_stack(&mut self, n: u32) -> Result<(), SyntaxError> {
        let new_stack = self.freereg + n;
        if new_stack > MAX_REGS {
            return self.err("function or expression needs too many registers");
        }
        if new_stack > self.proto.max_stack_size as u32 {
            self.proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: u32) -> Result<(), SyntaxError> {
        self.check_stack(n)?;
        self.freereg += n;
        Ok(())
    }

    fn free_reg(&mut self, r: u32) {
        if !is_k(r) && r >= self.nactvar {
            self.freereg -= 1;
            debug_assert_eq!(r, self.freereg);
        }
    }

    fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    /// Free both operand registers, higher one first so the frontier
    /// unwinds in order.
    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = if let ExpKind::NonReloc(r) = e1.kind { r as i64 } else { -1 };
        let r2 = if let ExpKind::NonReloc(r) = e2.kind { r as i64 } else { -1 };
        if r1 > r2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
    }

    // ==================================================================
    // Constants
    // ==================================================================

    fn add_constant(&mut self, key: ConstKey, val: Constant) -> Result<u32, SyntaxError> {
        if let Some(&idx) = self.const_map.get(&key) {
            return Ok(idx);
        }
        let idx = self.proto.constants.len() as u32;
        if idx > MAX_ARG_AX {
            return self.err("too many constants in one function");
        }
        self.proto.constants.push(val);
        self.const_map.insert(key, idx);
        Ok(idx)
    }

    pub fn string_k(&mut self, s: &[u8]) -> Result<u32, SyntaxError> {
        self.add_constant(ConstKey::Str(s.to_vec()), Constant::Str(s.to_vec()))
    }

    pub fn int_k(&mut self, i: i64) -> Result<u32, SyntaxError> {
        self.add_constant(ConstKey::Int(i), Constant::Int(i))
    }

    pub fn float_k(&mut self, f: f64) -> Result<u32, SyntaxError> {
        self.add_constant(ConstKey::Float(f.to_bits()), Constant::Float(f))
    }

    fn bool_k(&mut self, b: bool) -> Result<u32, SyntaxError> {
        self.add_constant(ConstKey::Bool(b), Constant::Bool(b))
    }

    fn nil_k(&mut self) -> Result<u32, SyntaxError> {
        self.add_constant(ConstKey::Nil, Constant::Nil)
    }

    // ==================================================================
    // Jumps and patch lists
    // ==================================================================

    /// Destination pc of the jump at `pc`, or NO_JUMP at list end.
    fn get_jump(&self, pc: i32) -> i32 {
        let off = self.proto.code[pc as usize].sbx();
        if off == NO_JUMP { NO_JUMP } else { pc + 1 + off }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), SyntaxError> {
        let offset = dest - (pc + 1);
        debug_assert_ne!(dest, NO_JUMP);
        if offset.abs() > MAX_ARG_SBX {
            return self.err("control structure too long");
        }
        self.proto.code[pc as usize].set_sbx(offset);
        Ok(())
    }

    /// The instruction controlling the jump at `pc`: the preceding
    /// test when there is one, else the jump itself.
    fn jump_control(&self, pc: i32) -> usize {
        let pc = pc as usize;
        if pc >= 1 && self.proto.code[pc - 1].opcode().is_test() { pc - 1 } else { pc }
    }

    /// Patch a TESTSET controlling `node` to produce its value in
    /// `reg`, or demote it to TEST when no value is wanted. Returns
    /// false when the control is not a TESTSET.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let at = self.jump_control(node);
        let ins = self.proto.code[at];
        if ins.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != ins.b() {
            self.proto.code[at].set_a(reg);
        } else {
            self.proto.code[at] = Instruction::abc(OpCode::Test, ins.b(), 0, ins.c());
        }
        true
    }

    /// True when some jump in the list does not come from a TESTSET,
    /// i.e. a boolean must be materialized for it.
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ins = self.proto.code[self.jump_control(list)];
            if ins.opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> Result<(), SyntaxError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    fn discharge_jpc(&mut self) {
        let jpc = self.jpc;
        self.jpc = NO_JUMP;
        let pc = self.pc();
        // Pending jumps always target a real instruction about to be
        // emitted; a failure here would mean the jump distance limit
        // was exceeded by jumps to the very next instruction.
        self.patch_list_aux(jpc, pc, NO_REG, pc)
            .expect("jump to next instruction fits");
    }

    /// Append list `l2` to list `l1`.
    pub fn concat_jumps(&mut self, l1: &mut i32, l2: i32) -> Result<(), SyntaxError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    /// Emit an unconditional jump, inheriting any jumps pending to this
    /// position so they move together with it.
    pub fn jump(&mut self) -> Result<i32, SyntaxError> {
        let save = self.jpc;
        self.jpc = NO_JUMP;
        let mut j = self.code_asbx(OpCode::Jmp, 0, NO_JUMP);
        self.concat_jumps(&mut j, save)?;
        Ok(j)
    }

    /// Mark the current position as a jump target, blocking peephole
    /// merges across it.
    pub fn get_label(&mut self) -> i32 {
        self.last_target = self.pc();
        self.last_target
    }

    pub fn patch_list(&mut self, list: i32, target: i32) -> Result<(), SyntaxError> {
        if target == self.pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    pub fn patch_to_here(&mut self, list: i32) -> Result<(), SyntaxError> {
        self.get_label();
        let mut jpc = self.jpc;
        self.concat_jumps(&mut jpc, list)?;
        self.jpc = jpc;
        Ok(())
    }

    /// Make every jump in `list` also close upvalues at or above
    /// `level`.
    pub fn patch_close(&mut self, mut list: i32, level: u32) {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            let ins = &mut self.proto.code[list as usize];
            debug_assert_eq!(ins.opcode(), OpCode::Jmp);
            ins.set_a(level + 1);
            list = next;
        }
    }

    // ==================================================================
    // Expression discharge
    // ==================================================================

    /// Resolve variable reads into computations: locals become
    /// registers, upvalue and table reads emit their load
    /// instructions, calls and varargs are clipped to one result.
    pub fn discharge_vars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local(r) => e.kind = ExpKind::NonReloc(r),
            ExpKind::Upval(u) => {
                let pc = self.code_abc(OpCode::GetUpval, 0, u, 0);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { obj, key, obj_is_upval } => {
                let pc = if obj_is_upval {
                    self.code_abc(OpCode::GetTabUp, 0, obj, key)
                } else {
                    self.free_reg(key);
                    self.free_reg(obj);
                    self.code_abc(OpCode::GetTable, 0, obj, key)
                };
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(pc) => {
                // One result: the call's own base register.
                e.kind = ExpKind::NonReloc(self.proto.code[pc as usize].a());
            }
            ExpKind::Vararg(pc) => {
                self.proto.code[pc as usize].set_b(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), SyntaxError> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil => self.nil(reg, 1),
            ExpKind::False => {
                self.code_abc(OpCode::LoadBool, reg, 0, 0);
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadBool, reg, 1, 0);
            }
            ExpKind::Const(k) => {
                self.code_k(reg, k);
            }
            ExpKind::ConstFloat(f) => {
                let k = self.float_k(f)?;
                self.code_k(reg, k);
            }
            ExpKind::ConstInt(i) => {
                let k = self.int_k(i)?;
                self.code_k(reg, k);
            }
            ExpKind::Reloc(pc) => {
                self.proto.code[pc as usize].set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::Move, reg, r, 0);
                }
            }
            ExpKind::Void | ExpKind::Jump(_) => return Ok(()),
            _ => unreachable!("variable kinds were discharged"),
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            self.discharge_to_reg(e, self.freereg - 1)?;
        }
        Ok(())
    }

    fn code_loadbool(&mut self, reg: u32, b: u32, jump: u32) -> i32 {
        self.get_label();
        self.code_abc(OpCode::LoadBool, reg, b, jump)
    }

    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), SyntaxError> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jump(pc) = e.kind {
            self.concat_jumps(&mut e.t, pc)?;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) { NO_JUMP } else { self.jump()? };
                p_f = self.code_loadbool(reg, 0, 1);
                p_t = self.code_loadbool(reg, 1, 0);
                self.patch_to_here(fj)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, p_f)?;
            self.patch_list_aux(e.t, end, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    /// Discharge the expression into the next free register.
    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        self.exp_to_reg(e, self.freereg - 1)
    }

    /// Discharge into any register, returning it.
    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u32, SyntaxError> {
        self.discharge_vars(e);
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.nactvar {
                // A temporary can hold the patched result in place.
                self.exp_to_reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(r) => Ok(r),
            _ => unreachable!("exp_to_next_reg leaves a register"),
        }
    }

    /// Like `exp_to_any_reg` but upvalues may stay upvalues.
    pub fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    /// Ensure the expression's value is available somewhere (register
    /// or constant), resolving pending jumps.
    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Discharge into an RK operand: a constant-pool reference when the
    /// constant fits the RK index space, else a register.
    pub fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<u32, SyntaxError> {
        self.exp_to_val(e)?;
        match e.kind {
            ExpKind::True | ExpKind::False | ExpKind::Nil => {
                if self.proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let k = match e.kind {
                        ExpKind::Nil => self.nil_k()?,
                        ExpKind::True => self.bool_k(true)?,
                        _ => self.bool_k(false)?,
                    };
                    e.kind = ExpKind::Const(k);
                    return Ok(rk_as_k(k));
                }
            }
            ExpKind::ConstInt(i) => {
                let k = self.int_k(i)?;
                e.kind = ExpKind::Const(k);
                if k <= MAX_INDEX_RK {
                    return Ok(rk_as_k(k));
                }
            }
            ExpKind::ConstFloat(f) => {
                let k = self.float_k(f)?;
                e.kind = ExpKind::Const(k);
                if k <= MAX_INDEX_RK {
                    return Ok(rk_as_k(k));
                }
            }
            ExpKind::Const(k) => {
                if k <= MAX_INDEX_RK {
                    return Ok(rk_as_k(k));
                }
            }
            _ => {}
        }
        self.exp_to_any_reg(e)
    }

    // ==================================================================
    // Variables and fields
    // ==================================================================

    /// Store `ex` into the variable described by `var`.
    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> Result<(), SyntaxError> {
        match var.kind {
            ExpKind::Local(r) => {
                self.free_exp(ex);
                self.exp_to_reg(ex, r)
            }
            ExpKind::Upval(u) => {
                let r = self.exp_to_any_reg(ex)?;
                self.code_abc(OpCode::SetUpval, r, u, 0);
                self.free_exp(ex);
                Ok(())
            }
            ExpKind::Indexed { obj, key, obj_is_upval } => {
                let rk = self.exp_to_rk(ex)?;
                let op = if obj_is_upval { OpCode::SetTabUp } else { OpCode::SetTable };
                self.code_abc(op, obj, key, rk);
                self.free_exp(ex);
                Ok(())
            }
            _ => unreachable!("invalid assignment target"),
        }
    }

    /// Rewrite `e` into `e.key` access.
    pub fn indexed(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), SyntaxError> {
        debug_assert!(!e.has_jumps());
        let obj_is_upval = matches!(e.kind, ExpKind::Upval(_));
        let obj = match e.kind {
            ExpKind::Upval(u) => u,
            ExpKind::NonReloc(r) | ExpKind::Local(r) => r,
            _ => unreachable!("indexable expressions live in a register or upvalue"),
        };
        let k = self.exp_to_rk(key)?;
        e.kind = ExpKind::Indexed { obj, key: k, obj_is_upval };
        Ok(())
    }

    /// `e:key` method prefix: emits SELF, leaving the method and the
    /// receiver in two fresh registers.
    pub fn self_op(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.exp_to_any_reg(e)?;
        let ereg = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("just discharged"),
        };
        self.free_exp(e);
        let base = self.freereg;
        e.kind = ExpKind::NonReloc(base);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.reserve_regs(2)?;
        let k = self.exp_to_rk(key)?;
        self.code_abc(OpCode::SelfOp, base, ereg, k);
        self.free_exp(key);
        Ok(())
    }

    // ==================================================================
    // Conditions
    // ==================================================================

    fn negate_condition(&mut self, e: &ExpDesc) {
        let pc = match e.kind {
            ExpKind::Jump(pc) => pc,
            _ => unreachable!("negation needs a jump"),
        };
        let at = self.jump_control(pc);
        let ins = &mut self.proto.code[at];
        debug_assert!(ins.opcode().is_test());
        debug_assert!(!matches!(ins.opcode(), OpCode::TestSet | OpCode::Test));
        let a = ins.a();
        ins.set_a(if a == 0 { 1 } else { 0 });
    }

    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, SyntaxError> {
        self.code_abc(op, a, b, c);
        self.jump()
    }

    /// Emit a conditional test on `e`, jumping when its truth equals
    /// `cond`.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: u32) -> Result<i32, SyntaxError> {
        if let ExpKind::Reloc(pc) = e.kind {
            let ins = self.proto.code[pc as usize];
            if ins.opcode() == OpCode::Not {
                // Fold the NOT into an inverted test on its operand.
                self.proto.code.pop();
                self.proto.line_info.pop();
                return self.cond_jump(OpCode::Test, ins.b(), 0, 1 - cond);
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let r = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("just discharged"),
        };
        self.cond_jump(OpCode::TestSet, NO_REG, r, cond)
    }

    /// Arrange for control to continue here only when `e` is true.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::Const(_) | ExpKind::ConstFloat(_) | ExpKind::ConstInt(_) | ExpKind::True => {
                NO_JUMP
            }
            ExpKind::Jump(pc) => {
                self.negate_condition(e);
                pc
            }
            _ => self.jump_on_cond(e, 0)?,
        };
        self.concat_jumps(&mut e.f, pc)?;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Arrange for control to continue here only when `e` is false.
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.discharge_vars(e);
        let pc = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            ExpKind::Jump(pc) => pc,
            _ => self.jump_on_cond(e, 1)?,
        };
        self.concat_jumps(&mut e.t, pc)?;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.discharge_vars(e);
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::Const(_) | ExpKind::ConstFloat(_) | ExpKind::ConstInt(_) | ExpKind::True => {
                e.kind = ExpKind::False;
            }
            ExpKind::Jump(_) => self.negate_condition(e),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let r = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!("just discharged"),
                };
                let pc = self.code_abc(OpCode::Not, 0, r, 0);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => unreachable!("variable kinds were discharged"),
        }
        // `not` swaps the branch roles, and no branch can produce a
        // non-boolean value afterwards.
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    // ==================================================================
    // Operators
    // ==================================================================

    /// Try to evaluate `op` over constant operands at compile time.
    /// Results that are NaN or zero floats stay unfolded so the
    /// constant pool never holds them (signed zeros would be lost).
    fn fold_binary(&mut self, op: BinOp, e1: &ExpDesc, e2: &ExpDesc) -> Option<ExpKind> {
        let a = e1.as_numeral()?;
        let b = e2.as_numeral()?;
        let folded = arith_const(op, a, b)?;
        match folded {
            Number::Int(i) => Some(ExpKind::ConstInt(i)),
            Number::Float(f) => {
                if f.is_nan() || f == 0.0 {
                    None
                } else {
                    Some(ExpKind::ConstFloat(f))
                }
            }
        }
    }

    fn code_binary_arith(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), SyntaxError> {
        let o2 = self.exp_to_rk(e2)?;
        let o1 = self.exp_to_rk(e1)?;
        self.free_exps(e1, e2);
        let pc = self.code_abc(op, 0, o1, o2);
        e1.kind = ExpKind::Reloc(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        self.fix_line(line);
        Ok(())
    }

    fn code_comparison(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), SyntaxError> {
        let mut o1 = self.exp_to_rk(e1)?;
        let mut o2 = self.exp_to_rk(e2)?;
        self.free_exps(e1, e2);
        let (opcode, mut cond) = match op {
            BinOp::Eq => (OpCode::Eq, 1),
            BinOp::Ne => (OpCode::Eq, 0),
            BinOp::Lt => (OpCode::Lt, 1),
            BinOp::Le => (OpCode::Le, 1),
            BinOp::Gt => (OpCode::Lt, 0),
            BinOp::Ge => (OpCode::Le, 0),
            _ => unreachable!("not a comparison"),
        };
        if cond == 0 && opcode != OpCode::Eq {
            // a > b becomes b < a.
            std::mem::swap(&mut o1, &mut o2);
            cond = 1;
        }
        let pc = self.cond_jump(opcode, cond, o1, o2)?;
        e1.kind = ExpKind::Jump(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        Ok(())
    }

    /// Apply a unary operator to `e`.
    pub fn prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> Result<(), SyntaxError> {
        match op {
            UnOp::Minus => {
                if let Some(n) = e.as_numeral() {
                    match n {
                        Number::Int(i) => {
                            e.kind = ExpKind::ConstInt(i.wrapping_neg());
                            return Ok(());
                        }
                        Number::Float(f) => {
                            let r = -f;
                            if !(r == 0.0 || r.is_nan()) {
                                e.kind = ExpKind::ConstFloat(r);
                                return Ok(());
                            }
                        }
                    }
                }
                self.code_unary(OpCode::Unm, e, line)
            }
            UnOp::BNot => {
                if let Some(n) = e.as_numeral() {
                    let as_int = match n {
                        Number::Int(i) => Some(i),
                        Number::Float(f) => numeric::float_to_int_exact(f),
                    };
                    if let Some(i) = as_int {
                        e.kind = ExpKind::ConstInt(!i);
                        return Ok(());
                    }
                }
                self.code_unary(OpCode::BNot, e, line)
            }
            UnOp::Not => self.code_not(e),
            UnOp::Len => self.code_unary(OpCode::Len, e, line),
        }
    }

    fn code_unary(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> Result<(), SyntaxError> {
        let r = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let pc = self.code_abc(op, 0, r, 0);
        e.kind = ExpKind::Reloc(pc);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.fix_line(line);
        Ok(())
    }

    /// Prepare the left operand before the right side is parsed.
    pub fn infix(&mut self, op: BinOp, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        match op {
            BinOp::And => self.go_if_true(e),
            BinOp::Or => self.go_if_false(e),
            BinOp::Concat => self.exp_to_next_reg(e),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.exp_to_rk(e)?;
                Ok(())
            }
            _ => {
                // Numeric operands may still fold; everything else goes
                // to an RK now.
                if e.as_numeral().is_none() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
        }
    }

    /// Combine the two operands after both sides are parsed.
    pub fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), SyntaxError> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP);
                self.discharge_vars(e2);
                self.concat_jumps(&mut e2.f, e1.f)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP);
                self.discharge_vars(e2);
                self.concat_jumps(&mut e2.t, e1.t)?;
                *e1 = *e2;
                Ok(())
            }
            BinOp::Concat => {
                self.exp_to_val(e2)?;
                if let ExpKind::Reloc(pc2) = e2.kind {
                    let ins = self.proto.code[pc2 as usize];
                    if ins.opcode() == OpCode::Concat {
                        // Fuse into the run: CONCAT is right-recursive.
                        if let ExpKind::NonReloc(r1) = e1.kind {
                            debug_assert_eq!(r1, ins.b() - 1);
                            self.free_exp(e1);
                            self.proto.code[pc2 as usize].set_b(r1);
                            e1.kind = ExpKind::Reloc(pc2);
                            e1.t = NO_JUMP;
                            e1.f = NO_JUMP;
                            self.fix_line(line);
                            return Ok(());
                        }
                    }
                }
                self.exp_to_next_reg(e2)?;
                let (r1, r2) = match (e1.kind, e2.kind) {
                    (ExpKind::NonReloc(a), ExpKind::NonReloc(b)) => (a, b),
                    _ => unreachable!("concat operands are in registers"),
                };
                self.free_exp(e2);
                self.free_exp(e1);
                let pc = self.code_abc(OpCode::Concat, 0, r1, r2);
                e1.kind = ExpKind::Reloc(pc);
                e1.t = NO_JUMP;
                e1.f = NO_JUMP;
                self.fix_line(line);
                Ok(())
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.code_comparison(op, e1, e2)
            }
            _ => {
                if let Some(folded) = self.fold_binary(op, e1, e2) {
                    e1.kind = folded;
                    return Ok(());
                }
                let opcode = op.arith_opcode().expect("arithmetic operator");
                self.code_binary_arith(opcode, e1, e2, line)
            }
        }
    }

    // ==================================================================
    // Calls, returns, lists
    // ==================================================================

    /// Fix an open-result expression (call or vararg) to produce
    /// `nresults` values.
    pub fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> Result<(), SyntaxError> {
        match e.kind {
            ExpKind::Call(pc) => {
                self.proto.code[pc as usize].set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg(pc) => {
                let reg = self.freereg;
                self.proto.code[pc as usize].set_b((nresults + 1) as u32);
                self.proto.code[pc as usize].set_a(reg);
                self.reserve_regs(1)?;
            }
            _ => unreachable!("only calls and varargs are multi-valued"),
        }
        Ok(())
    }

    pub fn set_multret(&mut self, e: &ExpDesc) -> Result<(), SyntaxError> {
        self.set_returns(e, selune_core::limits::MULTRET)
    }

    /// Emit RETURN for `nret` values starting at `first`; MULTRET
    /// returns everything up to the stack top.
    pub fn ret(&mut self, first: u32, nret: i32) {
        self.code_abc(OpCode::Return, first, (nret + 1) as u32, 0);
    }

    /// Emit SETLIST for `to_store` items (or all up to stack top) at
    /// batch `batch` (1-based, in FIELDS_PER_FLUSH units).
    pub fn set_list(
        &mut self,
        base: u32,
        nelems: u32,
        to_store: i32,
    ) -> Result<(), SyntaxError> {
        use selune_core::opcode::FIELDS_PER_FLUSH;
        let c = (nelems - 1) / FIELDS_PER_FLUSH + 1;
        let b = if to_store == selune_core::limits::MULTRET { 0 } else { to_store as u32 };
        if c <= MAX_ARG_C {
            self.code_abc(OpCode::SetList, base, b, c);
        } else if c <= MAX_ARG_AX {
            self.code_abc(OpCode::SetList, base, b, 0);
            self.code_extraarg(c);
        } else {
            return self.err("constructor too long");
        }
        self.freereg = base + 1;
        Ok(())
    }
}

/// Compile-time arithmetic over constant operands. `None` means the
/// operation cannot be safely folded (division by zero, bitwise on
/// non-integral floats).
fn arith_const(op: BinOp, a: Number, b: Number) -> Option<Number> {
    use Number::{Float, Int};
    let as_int = |n: Number| match n {
        Int(i) => Some(i),
        Float(f) => numeric::float_to_int_exact(f),
    };
    let as_float = |n: Number| match n {
        Int(i) => i as f64,
        Float(f) => f,
    };
    Some(match op {
        BinOp::Add => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_add(y)),
            _ => Float(as_float(a) + as_float(b)),
        },
        BinOp::Sub => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_sub(y)),
            _ => Float(as_float(a) - as_float(b)),
        },
        BinOp::Mul => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_mul(y)),
            _ => Float(as_float(a) * as_float(b)),
        },
        BinOp::Div => Float(as_float(a) / as_float(b)),
        BinOp::Pow => Float(as_float(a).powf(as_float(b))),
        BinOp::IDiv => match (a, b) {
            (Int(x), Int(y)) => Int(numeric::int_floor_div(x, y)?),
            _ => Float(numeric::float_floor_div(as_float(a), as_float(b))),
        },
        BinOp::Mod => match (a, b) {
            (Int(x), Int(y)) => Int(numeric::int_floor_mod(x, y)?),
            _ => Float(numeric::float_floor_mod(as_float(a), as_float(b))),
        },
        BinOp::BAnd => Int(as_int(a)? & as_int(b)?),
        BinOp::BOr => Int(as_int(a)? | as_int(b)?),
        BinOp::BXor => Int(as_int(a)? ^ as_int(b)?),
        BinOp::Shl => Int(numeric::shift_left(as_int(a)?, as_int(b)?)),
        BinOp::Shr => Int(numeric::shift_left(as_int(a)?, as_int(b)?.wrapping_neg())),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binop_priorities_nest_correctly() {
        // '^' binds tighter than unary minus, which binds tighter than
        // '*'; '..' is right-associative.
        assert!(BinOp::Pow.priority().0 > UNARY_PRIORITY);
        assert!(UNARY_PRIORITY > BinOp::Mul.priority().0);
        let (l, r) = BinOp::Concat.priority();
        assert!(r < l);
    }

    #[test]
    fn constant_pool_keeps_int_and_float_apart() {
        let mut fs = FuncState::new("t".into(), b"=t".to_vec());
        let ki = fs.int_k(1).unwrap();
        let kf = fs.float_k(1.0).unwrap();
        assert_ne!(ki, kf);
        assert_eq!(fs.int_k(1).unwrap(), ki);
        assert_eq!(fs.string_k(b"x").unwrap(), fs.string_k(b"x").unwrap());
    }

    #[test]
    fn fold_keeps_integer_arithmetic_integral() {
        assert_eq!(arith_const(BinOp::Add, Number::Int(2), Number::Int(3)), Some(Number::Int(5)));
        assert_eq!(
            arith_const(BinOp::Div, Number::Int(1), Number::Int(2)),
            Some(Number::Float(0.5))
        );
        assert_eq!(arith_const(BinOp::IDiv, Number::Int(7), Number::Int(0)), None);
        assert_eq!(arith_const(BinOp::BAnd, Number::Float(2.5), Number::Int(1)), None);
        assert_eq!(
            arith_const(BinOp::Shl, Number::Int(1), Number::Int(8)),
            Some(Number::Int(256))
        );
    }

    #[test]
    fn loadnil_merges_adjacent_ranges() {
        let mut fs = FuncState::new("t".into(), b"=t".to_vec());
        fs.nil(0, 2);
        fs.nil(2, 1);
        assert_eq!(fs.proto.code.len(), 1);
        let ins = fs.proto.code[0];
        assert_eq!(ins.opcode(), OpCode::LoadNil);
        assert_eq!((ins.a(), ins.b()), (0, 2));
    }

    #[test]
    fn jump_list_concatenation() {
        let mut fs = FuncState::new("t".into(), b"=t".to_vec());
        let j1 = fs.jump().unwrap();
        let j2 = fs.jump().unwrap();
        let mut list = j1;
        fs.concat_jumps(&mut list, j2).unwrap();
        // Walk the chain: j1 links to j2.
        assert_eq!(fs.get_jump(j1), j2);
        assert_eq!(fs.get_jump(j2), NO_JUMP);
        fs.code_abc(OpCode::Return, 0, 1, 0);
        fs.patch_list(list, 2).unwrap();
        assert_eq!(fs.get_jump(j1), 2);
        assert_eq!(fs.get_jump(j2), 2);
    }

    #[test]
    fn rk_encoding_for_small_constants() {
        let mut fs = FuncState::new("t".into(), b"=t".to_vec());
        let mut e = ExpDesc::new(ExpKind::ConstInt(7));
        let rk = fs.exp_to_rk(&mut e).unwrap();
        assert!(is_k(rk));
        assert_eq!(selune_core::opcode::index_k(rk), 0);
    }
}
