//! Single-pass recursive-descent parser.
//!
//! There is no AST: each grammar production drives the code emitter
//! directly through expression descriptors. Function nesting is a stack
//! of `FuncLevel`s; resolving a name walks that stack outward and
//! back-fills upvalue descriptors on the way in. Labels and pending
//! gotos live in flat lists segmented per lexical block by the indices
//! saved in each `Block`.

use selune_core::limits::{MAX_PARSER_DEPTH, MAX_UPVALUES, MULTRET};
use selune_core::opcode::{FIELDS_PER_FLUSH, NO_JUMP, OpCode, int_to_fb};
use selune_core::proto::{LocVar, ProtoDesc, UpvalDesc};

use crate::SyntaxError;
use crate::codegen::{BinOp, ExpDesc, ExpKind, FuncState, UNARY_PRIORITY, UnOp};
use crate::lexer::{Lexer, Token};

/// A label or a pending goto.
struct LabelDesc {
    name: Vec<u8>,
    /// Position: the label's target pc, or the goto's jump pc.
    pc: i32,
    /// Source line, for error messages.
    line: u32,
    /// Active locals at the point of the label/goto.
    nactvar: u32,
}

/// One lexical block.
struct Block {
    first_label: usize,
    first_goto: usize,
    nactvar: u32,
    /// Some local of this block is captured as an upvalue.
    upval: bool,
    is_loop: bool,
}

/// One function being compiled.
struct FuncLevel {
    fs: FuncState,
    blocks: Vec<Block>,
}

pub struct Parser<'src> {
    lx: Lexer<'src>,
    tok: Token,
    levels: Vec<FuncLevel>,
    labels: Vec<LabelDesc>,
    gotos: Vec<LabelDesc>,
    depth: u32,
}

/// Compile a chunk into its main function prototype. The main function
/// is always variadic and closes over one upvalue, the globals
/// environment. `chunk_name` follows the usual conventions: `@` marks a
/// file name, `=` a verbatim name, anything else is treated as source
/// text.
pub fn parse(source: &[u8], chunk_name: &[u8]) -> Result<ProtoDesc, SyntaxError> {
    let display = selune_core::proto::chunk_id(chunk_name);
    let mut lx = Lexer::new(source, display);
    let tok = lx.next()?;
    let mut p = Parser {
        lx,
        tok,
        levels: Vec::new(),
        labels: Vec::new(),
        gotos: Vec::new(),
        depth: 0,
    };
    p.main_func(chunk_name)
}

impl<'src> Parser<'src> {
    // ==================================================================
    // Token plumbing
    // ==================================================================

    fn next(&mut self) -> Result<(), SyntaxError> {
        self.tok = self.lx.next()?;
        Ok(())
    }

    fn test_next(&mut self, t: &Token) -> Result<bool, SyntaxError> {
        if &self.tok == t {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check(&self, t: &Token) -> Result<(), SyntaxError> {
        if &self.tok != t {
            return self.error_expected(t);
        }
        Ok(())
    }

    fn check_next(&mut self, t: &Token) -> Result<(), SyntaxError> {
        self.check(t)?;
        self.next()
    }

    fn check_name(&mut self) -> Result<Vec<u8>, SyntaxError> {
        match std::mem::replace(&mut self.tok, Token::Eof) {
            Token::Name(n) => {
                self.next()?;
                Ok(n)
            }
            other => {
                self.tok = other;
                self.error_expected(&Token::Name(Vec::new()))?;
                unreachable!()
            }
        }
    }

    fn error<T>(&self, msg: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError::new(
            self.lx.chunk_name().to_string(),
            self.lx.line,
            format!("{} near '{}'", msg.into(), self.tok.describe()),
        ))
    }

    fn error_at<T>(&self, msg: impl Into<String>, line: u32) -> Result<T, SyntaxError> {
        Err(SyntaxError::new(self.lx.chunk_name().to_string(), line, msg.into()))
    }

    fn error_expected<T>(&self, t: &Token) -> Result<T, SyntaxError> {
        let what = match t {
            Token::Name(_) => "<name>".to_string(),
            other => format!("'{}'", other.describe()),
        };
        self.error(format!("{what} expected"))
    }

    fn check_match(&mut self, what: &Token, who: &Token, line: u32) -> Result<(), SyntaxError> {
        if !self.test_next(what)? {
            if line == self.lx.line {
                return self.error_expected(what);
            }
            return self.error(format!(
                "'{}' expected (to close '{}' at line {line})",
                what.describe(),
                who.describe()
            ));
        }
        Ok(())
    }

    fn check_limit(&self, value: usize, limit: usize, what: &str) -> Result<(), SyntaxError> {
        if value > limit {
            let level = self.levels.last().expect("inside a function");
            let whence = if level.fs.proto.line_defined == 0 {
                "main function".to_string()
            } else {
                format!("function at line {}", level.fs.proto.line_defined)
            };
            return self.error_at(
                format!("too many {what} (limit is {limit}) in {whence}"),
                self.lx.line,
            );
        }
        Ok(())
    }

    fn enter_level(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_PARSER_DEPTH {
            return self.error_at("chunk has too many syntax levels", self.lx.line);
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    fn fs(&mut self) -> &mut FuncState {
        &mut self.levels.last_mut().expect("inside a function").fs
    }

    fn sync_line(&mut self) {
        let line = self.lx.line;
        self.fs().line = line;
    }

    // ==================================================================
    // Local variables and upvalues
    // ==================================================================

    fn new_local(&mut self, name: Vec<u8>) -> Result<(), SyntaxError> {
        let level = self.levels.last_mut().expect("inside a function");
        let idx = level.fs.proto.loc_vars.len();
        level.fs.proto.loc_vars.push(LocVar { name, start_pc: 0, end_pc: 0 });
        level.fs.actvar.push(idx);
        let nact = level.fs.actvar.len();
        self.check_limit(nact, selune_core::limits::MAX_LOCALS as usize, "local variables")
    }

    /// Bring the last `n` declared locals into scope.
    fn adjust_local_vars(&mut self, n: u32) {
        let fs = self.fs();
        let pc = fs.pc() as u32;
        fs.nactvar += n;
        for i in (fs.nactvar - n)..fs.nactvar {
            let idx = fs.actvar[i as usize];
            fs.proto.loc_vars[idx].start_pc = pc;
        }
    }

    /// Deactivate locals down to `to_level`, closing their debug
    /// ranges.
    fn remove_vars(&mut self, to_level: u32) {
        let fs = self.fs();
        let pc = fs.pc() as u32;
        while fs.nactvar > to_level {
            fs.nactvar -= 1;
            let idx = fs.actvar.pop().expect("active var");
            fs.proto.loc_vars[idx].end_pc = pc;
        }
    }

    fn search_local(&self, level: usize, name: &[u8]) -> Option<u32> {
        let fs = &self.levels[level].fs;
        (0..fs.nactvar).rev().find(|&i| {
            let idx = fs.actvar[i as usize];
            fs.proto.loc_vars[idx].name == name
        })
    }

    fn search_upvalue(&self, level: usize, name: &[u8]) -> Option<u32> {
        self.levels[level]
            .fs
            .proto
            .upvalue_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u32)
    }

    fn new_upvalue(
        &mut self,
        level: usize,
        name: &[u8],
        desc: UpvalDesc,
    ) -> Result<u32, SyntaxError> {
        let proto = &mut self.levels[level].fs.proto;
        let idx = proto.upvalues.len() as u32;
        if idx >= MAX_UPVALUES {
            return self.error_at("too many upvalues", self.lx.line);
        }
        proto.upvalues.push(desc);
        proto.upvalue_names.push(name.to_vec());
        Ok(idx)
    }

    /// Mark the innermost block of `level` containing register `v` as
    /// having a captured local.
    fn mark_upval(&mut self, level: usize, v: u32) {
        let blocks = &mut self.levels[level].blocks;
        for b in blocks.iter_mut().rev() {
            if b.nactvar <= v {
                b.upval = true;
                return;
            }
        }
    }

    /// Resolve `name` at function-nesting `level`, creating upvalue
    /// chains through intermediate functions.
    fn single_var_aux(
        &mut self,
        level: usize,
        name: &[u8],
        base: bool,
    ) -> Result<ExpKind, SyntaxError> {
        if let Some(r) = self.search_local(level, name) {
            if !base {
                self.mark_upval(level, r);
            }
            return Ok(ExpKind::Local(r));
        }
        if let Some(u) = self.search_upvalue(level, name) {
            return Ok(ExpKind::Upval(u));
        }
        if level == 0 {
            return Ok(ExpKind::Void);
        }
        match self.single_var_aux(level - 1, name, false)? {
            ExpKind::Void => Ok(ExpKind::Void),
            ExpKind::Local(r) => {
                let u = self.new_upvalue(level, name, UpvalDesc { in_stack: true, index: r as u8 })?;
                Ok(ExpKind::Upval(u))
            }
            ExpKind::Upval(pu) => {
                let u =
                    self.new_upvalue(level, name, UpvalDesc { in_stack: false, index: pu as u8 })?;
                Ok(ExpKind::Upval(u))
            }
            _ => unreachable!("name resolution yields locals or upvalues"),
        }
    }

    /// Resolve a bare name: a local, an upvalue, or a field of the
    /// environment.
    fn single_var(&mut self) -> Result<ExpDesc, SyntaxError> {
        let name = self.check_name()?;
        let top = self.levels.len() - 1;
        let kind = self.single_var_aux(top, &name, true)?;
        if kind != ExpKind::Void {
            return Ok(ExpDesc::new(kind));
        }
        // Unqualified global: _ENV[name]. The environment upvalue
        // always resolves (the main function owns it).
        let env_kind = self.single_var_aux(top, b"_ENV", true)?;
        debug_assert_ne!(env_kind, ExpKind::Void);
        let mut e = ExpDesc::new(env_kind);
        let k = self.fs().string_k(&name)?;
        let mut key = ExpDesc::new(ExpKind::Const(k));
        self.fs().indexed(&mut e, &mut key)?;
        Ok(e)
    }

    // ==================================================================
    // Blocks, labels, gotos
    // ==================================================================

    fn enter_block(&mut self, is_loop: bool) {
        let first_label = self.labels.len();
        let first_goto = self.gotos.len();
        let level = self.levels.last_mut().expect("inside a function");
        debug_assert_eq!(level.fs.freereg, level.fs.nactvar);
        level.blocks.push(Block {
            first_label,
            first_goto,
            nactvar: level.fs.nactvar,
            upval: false,
            is_loop,
        });
    }

    fn leave_block(&mut self) -> Result<(), SyntaxError> {
        let level = self.levels.last_mut().expect("inside a function");
        let bl = level.blocks.pop().expect("block open");
        let has_previous = !level.blocks.is_empty();
        if has_previous && bl.upval {
            // Back edges out of this block must close its captured
            // locals.
            let fs = &mut level.fs;
            let j = fs.jump()?;
            fs.patch_close(j, bl.nactvar);
            fs.patch_to_here(j)?;
        }
        if bl.is_loop {
            self.break_label(&bl)?;
        }
        self.remove_vars(bl.nactvar);
        let fs = self.fs();
        debug_assert_eq!(bl.nactvar, fs.nactvar);
        fs.freereg = fs.nactvar;
        self.labels.truncate(bl.first_label);
        if has_previous {
            self.move_gotos_out(&bl)
        } else if bl.first_goto < self.gotos.len() {
            self.undef_goto(bl.first_goto)
        } else {
            Ok(())
        }
    }

    /// Define the implicit "break" label at the loop end and resolve
    /// pending breaks against it.
    fn break_label(&mut self, bl: &Block) -> Result<(), SyntaxError> {
        let pc = self.fs().get_label();
        let nactvar = self.fs().nactvar;
        self.labels.push(LabelDesc { name: b"break".to_vec(), pc, line: 0, nactvar });
        self.find_gotos(self.labels.len() - 1, bl.first_goto)
    }

    /// Match pending gotos (from `first_goto` on) against label
    /// `label_idx`.
    fn find_gotos(&mut self, label_idx: usize, first_goto: usize) -> Result<(), SyntaxError> {
        let mut i = first_goto;
        while i < self.gotos.len() {
            if self.gotos[i].name == self.labels[label_idx].name {
                self.close_goto(i, label_idx)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Patch goto `g` to label `label_idx` and drop it from the pending
    /// list.
    fn close_goto(&mut self, g: usize, label_idx: usize) -> Result<(), SyntaxError> {
        let (gt_pc, gt_line, gt_nactvar, gt_name) = {
            let gt = &self.gotos[g];
            (gt.pc, gt.line, gt.nactvar, gt.name.clone())
        };
        let lb_nactvar = self.labels[label_idx].nactvar;
        if gt_nactvar < lb_nactvar {
            let fs = self.fs();
            let idx = fs.actvar[gt_nactvar as usize];
            let var = String::from_utf8_lossy(&fs.proto.loc_vars[idx].name).into_owned();
            let name = String::from_utf8_lossy(&gt_name).into_owned();
            return self.error_at(
                format!(
                    "<goto {name}> at line {gt_line} jumps into the scope of local '{var}'"
                ),
                self.lx.line,
            );
        }
        let lb_pc = self.labels[label_idx].pc;
        self.fs().patch_list(gt_pc, lb_pc)?;
        self.gotos.remove(g);
        Ok(())
    }

    /// Try to resolve goto `g` against the labels of the current block.
    fn find_label(&mut self, g: usize) -> Result<bool, SyntaxError> {
        let level = self.levels.last().expect("inside a function");
        let bl = level.blocks.last().expect("block open");
        let (first_label, bl_upval, bl_first_label) = (bl.first_label, bl.upval, bl.first_label);
        for i in first_label..self.labels.len() {
            if self.labels[i].name == self.gotos[g].name {
                if self.gotos[g].nactvar > self.labels[i].nactvar
                    && (bl_upval || self.labels.len() > bl_first_label)
                {
                    let pc = self.gotos[g].pc;
                    let level = self.labels[i].nactvar;
                    self.fs().patch_close(pc, level);
                }
                self.close_goto(g, i)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hand this block's unresolved gotos to the enclosing block,
    /// inserting upvalue closes where they now leave a capturing
    /// scope.
    fn move_gotos_out(&mut self, bl: &Block) -> Result<(), SyntaxError> {
        let mut i = bl.first_goto;
        while i < self.gotos.len() {
            if self.gotos[i].nactvar > bl.nactvar {
                if bl.upval {
                    let pc = self.gotos[i].pc;
                    self.fs().patch_close(pc, bl.nactvar);
                }
                self.gotos[i].nactvar = bl.nactvar;
            }
            if !self.find_label(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    fn undef_goto(&mut self, g: usize) -> Result<(), SyntaxError> {
        let gt = &self.gotos[g];
        let name = String::from_utf8_lossy(&gt.name).into_owned();
        let msg = if gt.name == b"break" {
            format!("break outside a loop at line {}", gt.line)
        } else {
            format!("no visible label '{name}' for goto at line {}", gt.line)
        };
        self.error_at(msg, self.lx.line)
    }

    // ==================================================================
    // Functions
    // ==================================================================

    fn open_func(&mut self, line_defined: u32) {
        let source = self
            .levels
            .first()
            .map(|l| l.fs.proto.source.clone())
            .unwrap_or_default();
        let mut fs = FuncState::new(self.lx.chunk_name().to_string(), source);
        fs.proto.line_defined = line_defined;
        fs.line = self.lx.line;
        self.levels.push(FuncLevel { fs, blocks: Vec::new() });
        self.enter_block(false);
    }

    fn close_func(&mut self) -> Result<ProtoDesc, SyntaxError> {
        self.sync_line();
        self.fs().ret(0, 0);
        self.leave_block()?;
        let level = self.levels.pop().expect("open function");
        debug_assert!(level.blocks.is_empty());
        Ok(level.fs.proto)
    }

    fn main_func(&mut self, chunk_name: &[u8]) -> Result<ProtoDesc, SyntaxError> {
        let mut fs = FuncState::new(self.lx.chunk_name().to_string(), chunk_name.to_vec());
        fs.proto.is_vararg = true;
        fs.line = self.lx.line;
        self.levels.push(FuncLevel { fs, blocks: Vec::new() });
        self.enter_block(false);
        self.new_upvalue(0, b"_ENV", UpvalDesc { in_stack: true, index: 0 })?;
        self.stat_list()?;
        if self.tok != Token::Eof {
            return self.error("'<eof>' expected");
        }
        self.close_func()
    }

    /// `body -> ( parlist ) block end`; emits the CLOSURE instruction
    /// in the enclosing function.
    fn body(&mut self, is_method: bool, line: u32) -> Result<ExpDesc, SyntaxError> {
        self.open_func(line);
        self.check_next(&Token::LParen)?;
        if is_method {
            self.new_local(b"self".to_vec())?;
            self.adjust_local_vars(1);
        }
        self.par_list()?;
        self.check_next(&Token::RParen)?;
        self.stat_list()?;
        let end_line = self.lx.line;
        self.fs().proto.last_line_defined = end_line;
        self.check_match(&Token::End, &Token::Function, line)?;
        let proto = self.close_func()?;
        let fs = self.fs();
        fs.proto.protos.push(proto);
        let bx = (fs.proto.protos.len() - 1) as u32;
        let pc = fs.code_abx(OpCode::Closure, 0, bx);
        let mut e = ExpDesc::new(ExpKind::Reloc(pc));
        fs.exp_to_next_reg(&mut e)?;
        Ok(e)
    }

    fn par_list(&mut self) -> Result<(), SyntaxError> {
        let mut nparams: u32 = 0;
        if self.tok != Token::RParen {
            loop {
                match &self.tok {
                    Token::Name(_) => {
                        let name = self.check_name()?;
                        self.new_local(name)?;
                        nparams += 1;
                    }
                    Token::Ellipsis => {
                        self.next()?;
                        self.fs().proto.is_vararg = true;
                    }
                    _ => return self.error("<name> or '...' expected"),
                }
                if self.fs().proto.is_vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let fs = self.fs();
        fs.proto.num_params = fs.nactvar as u8;
        let n = fs.nactvar;
        fs.reserve_regs(n)
    }

    // ==================================================================
    // Statements
    // ==================================================================

    fn block_follow(&self, with_until: bool) -> bool {
        matches!(self.tok, Token::Else | Token::Elseif | Token::End | Token::Eof)
            || (with_until && self.tok == Token::Until)
    }

    fn stat_list(&mut self) -> Result<(), SyntaxError> {
        while !self.block_follow(true) {
            if self.tok == Token::Return {
                self.statement()?;
                return Ok(());
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block(&mut self) -> Result<(), SyntaxError> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    fn statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.lx.line;
        self.enter_level()?;
        self.sync_line();
        match &self.tok {
            Token::Semicolon => self.next()?,
            Token::If => self.if_stat(line)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.next()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat(line)?,
            Token::Function => self.func_stat(line)?,
            Token::Local => {
                self.next()?;
                if self.test_next(&Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DoubleColon => {
                self.next()?;
                self.label_stat(line)?;
            }
            Token::Return => {
                self.next()?;
                self.ret_stat()?;
            }
            Token::Break | Token::Goto => self.goto_stat(None)?,
            _ => self.expr_stat()?,
        }
        let fs = self.fs();
        debug_assert!(fs.freereg >= fs.nactvar);
        fs.freereg = fs.nactvar;
        self.leave_level();
        Ok(())
    }

    /// `cond -> exp`, yielding the false-exit patch list.
    fn cond(&mut self) -> Result<i32, SyntaxError> {
        let mut v = self.expression()?;
        if v.kind == ExpKind::Nil {
            v.kind = ExpKind::False;
        }
        self.fs().go_if_true(&mut v)?;
        Ok(v.f)
    }

    fn while_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        self.next()?;
        let init = self.fs().get_label();
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.check_next(&Token::Do)?;
        self.block()?;
        let back = self.fs().jump()?;
        self.fs().patch_list(back, init)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block()?;
        self.fs().patch_to_here(cond_exit)
    }

    fn repeat_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        let init = self.fs().get_label();
        self.enter_block(true);
        self.enter_block(false);
        self.next()?;
        self.stat_list()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        // Locals of the body stay visible to the condition.
        let cond_exit = self.cond()?;
        let inner = self.levels.last().expect("inside a function");
        let scope = inner.blocks.last().expect("repeat scope");
        if scope.upval {
            let nactvar = scope.nactvar;
            self.fs().patch_close(cond_exit, nactvar);
        }
        self.leave_block()?;
        self.fs().patch_list(cond_exit, init)?;
        self.leave_block()
    }

    fn test_then_block(&mut self, escape: &mut i32) -> Result<(), SyntaxError> {
        self.next()?; // skip if/elseif
        let mut v = self.expression()?;
        self.check_next(&Token::Then)?;
        let jf;
        if matches!(self.tok, Token::Goto | Token::Break) {
            self.fs().go_if_false(&mut v)?;
            self.enter_block(false);
            let t = v.t;
            self.goto_stat(Some(t))?;
            while self.test_next(&Token::Semicolon)? {}
            if self.block_follow(false) {
                return self.leave_block();
            }
            jf = self.fs().jump()?;
        } else {
            self.fs().go_if_true(&mut v)?;
            self.enter_block(false);
            jf = v.f;
        }
        self.stat_list()?;
        self.leave_block()?;
        if matches!(self.tok, Token::Else | Token::Elseif) {
            let j = self.fs().jump()?;
            self.fs().concat_jumps(escape, j)?;
        }
        self.fs().patch_to_here(jf)
    }

    fn if_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        let mut escape = NO_JUMP;
        self.test_then_block(&mut escape)?;
        while self.tok == Token::Elseif {
            self.test_then_block(&mut escape)?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?;
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.fs().patch_to_here(escape)
    }

    fn goto_stat(&mut self, pc: Option<i32>) -> Result<(), SyntaxError> {
        let line = self.lx.line;
        let pc = match pc {
            Some(pc) => pc,
            None => self.fs().jump()?,
        };
        let name = if self.test_next(&Token::Goto)? {
            self.check_name()?
        } else {
            self.next()?; // skip break
            b"break".to_vec()
        };
        let nactvar = self.fs().nactvar;
        self.gotos.push(LabelDesc { name, pc, line, nactvar });
        self.find_label(self.gotos.len() - 1)?;
        Ok(())
    }

    fn label_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        let name = self.check_name()?;
        // Repeated label in the same scope?
        let level = self.levels.last().expect("inside a function");
        let first = level.blocks.last().expect("block open").first_label;
        for lb in &self.labels[first..] {
            if lb.name == name {
                let prev = lb.line;
                return self.error_at(
                    format!(
                        "label '{}' already defined on line {prev}",
                        String::from_utf8_lossy(&name)
                    ),
                    line,
                );
            }
        }
        self.check_next(&Token::DoubleColon)?;
        let pc = self.fs().get_label();
        let nactvar = self.fs().nactvar;
        self.labels.push(LabelDesc { name, pc, line, nactvar });
        let idx = self.labels.len() - 1;
        // Skip trailing no-op statements so a label at block end treats
        // the block's locals as already dead.
        while matches!(self.tok, Token::Semicolon | Token::DoubleColon) {
            self.statement()?;
        }
        if self.block_follow(false) {
            let level = self.levels.last().expect("inside a function");
            self.labels[idx].nactvar = level.blocks.last().expect("block open").nactvar;
        }
        let first_goto = {
            let level = self.levels.last().expect("inside a function");
            level.blocks.last().expect("block open").first_goto
        };
        self.find_gotos(idx, first_goto)
    }

    fn for_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        self.enter_block(true);
        self.next()?; // skip for
        let name = self.check_name()?;
        match &self.tok {
            Token::Assign => self.for_num(name, line)?,
            Token::Comma | Token::In => self.for_list(name)?,
            _ => return self.error("'=' or 'in' expected"),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.leave_block()
    }

    /// One closed expression into the next register.
    fn exp1(&mut self) -> Result<(), SyntaxError> {
        let mut e = self.expression()?;
        self.fs().exp_to_next_reg(&mut e)
    }

    fn for_num(&mut self, name: Vec<u8>, line: u32) -> Result<(), SyntaxError> {
        let base = self.fs().freereg;
        self.new_local(b"(for index)".to_vec())?;
        self.new_local(b"(for limit)".to_vec())?;
        self.new_local(b"(for step)".to_vec())?;
        self.new_local(name)?;
        self.check_next(&Token::Assign)?;
        self.exp1()?;
        self.check_next(&Token::Comma)?;
        self.exp1()?;
        if self.test_next(&Token::Comma)? {
            self.exp1()?;
        } else {
            // Default step 1.
            let fs = self.fs();
            let k = fs.int_k(1)?;
            let mut e = ExpDesc::new(ExpKind::Const(k));
            fs.exp_to_next_reg(&mut e)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, first_name: Vec<u8>) -> Result<(), SyntaxError> {
        let base = self.fs().freereg;
        self.new_local(b"(for generator)".to_vec())?;
        self.new_local(b"(for state)".to_vec())?;
        self.new_local(b"(for control)".to_vec())?;
        let mut nvars: u32 = 4;
        self.new_local(first_name)?;
        while self.test_next(&Token::Comma)? {
            let name = self.check_name()?;
            self.new_local(name)?;
            nvars += 1;
        }
        self.check_next(&Token::In)?;
        let line = self.lx.line;
        let (nexps, mut e) = self.exp_list()?;
        self.adjust_assign(3, nexps, &mut e)?;
        self.fs().check_stack(3)?; // room to call the generator
        self.for_body(base, line, nvars - 3, false)
    }

    fn for_body(&mut self, base: u32, line: u32, nvars: u32, is_num: bool) -> Result<(), SyntaxError> {
        self.adjust_local_vars(3);
        self.check_next(&Token::Do)?;
        let prep = if is_num {
            self.fs().code_asbx(OpCode::ForPrep, base, NO_JUMP)
        } else {
            self.fs().jump()?
        };
        self.enter_block(false);
        self.adjust_local_vars(nvars);
        self.fs().reserve_regs(nvars)?;
        self.block()?;
        self.leave_block()?;
        self.fs().patch_to_here(prep)?;
        let end_for = if is_num {
            self.fs().code_asbx(OpCode::ForLoop, base, NO_JUMP)
        } else {
            let fs = self.fs();
            fs.code_abc(OpCode::TForCall, base, 0, nvars);
            fs.fix_line(line);
            fs.code_asbx(OpCode::TForLoop, base + 2, NO_JUMP)
        };
        self.fs().patch_list(end_for, prep + 1)?;
        self.fs().fix_line(line);
        Ok(())
    }

    fn local_func(&mut self) -> Result<(), SyntaxError> {
        let line = self.lx.line;
        let name = self.check_name()?;
        self.new_local(name)?;
        self.adjust_local_vars(1);
        let b = self.body(false, line)?;
        // The local only becomes visible after its initializer.
        let fs = self.fs();
        if let ExpKind::NonReloc(r) = b.kind {
            let idx = fs.actvar[r as usize];
            fs.proto.loc_vars[idx].start_pc = fs.pc() as u32;
        }
        Ok(())
    }

    fn local_stat(&mut self) -> Result<(), SyntaxError> {
        let mut nvars: u32 = 0;
        loop {
            let name = self.check_name()?;
            self.new_local(name)?;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let (nexps, mut e) = if self.test_next(&Token::Assign)? {
            self.exp_list()?
        } else {
            (0, ExpDesc::new(ExpKind::Void))
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    fn func_name(&mut self) -> Result<(ExpDesc, bool), SyntaxError> {
        let mut e = self.single_var()?;
        while self.tok == Token::Dot {
            self.field_sel(&mut e)?;
        }
        let mut is_method = false;
        if self.tok == Token::Colon {
            is_method = true;
            self.field_sel(&mut e)?;
        }
        Ok((e, is_method))
    }

    fn func_stat(&mut self, line: u32) -> Result<(), SyntaxError> {
        self.next()?; // skip function
        let (v, is_method) = self.func_name()?;
        let mut b = self.body(is_method, line)?;
        self.fs().store_var(&v, &mut b)?;
        self.fs().fix_line(line);
        Ok(())
    }

    fn expr_stat(&mut self) -> Result<(), SyntaxError> {
        let v = self.suffixed_exp()?;
        if matches!(self.tok, Token::Assign | Token::Comma) {
            let mut targets = vec![v];
            self.assignment(&mut targets)?;
        } else {
            match v.kind {
                ExpKind::Call(pc) => {
                    // Statement call: no results.
                    self.fs().proto.code[pc as usize].set_c(1);
                }
                _ => return self.error("syntax error"),
            }
        }
        Ok(())
    }

    fn is_var_kind(kind: ExpKind) -> bool {
        matches!(
            kind,
            ExpKind::Local(_) | ExpKind::Upval(_) | ExpKind::Indexed { .. }
        )
    }

    /// When a later assignment target is the local or upvalue that an
    /// earlier indexed target reads, copy the current value to a fresh
    /// register and redirect the earlier target to it.
    fn check_conflict(&mut self, targets: &mut [ExpDesc], v: &ExpDesc) -> Result<(), SyntaxError> {
        let extra = self.fs().freereg;
        let mut conflict = false;
        for lh in targets.iter_mut() {
            if let ExpKind::Indexed { obj, key, obj_is_upval } = &mut lh.kind {
                match v.kind {
                    ExpKind::Upval(u) => {
                        if *obj_is_upval && *obj == u {
                            conflict = true;
                            *obj_is_upval = false;
                            *obj = extra;
                        }
                    }
                    ExpKind::Local(r) => {
                        if !*obj_is_upval && *obj == r {
                            conflict = true;
                            *obj = extra;
                        }
                        // The key cannot be an upvalue, only a register.
                        if *key == r {
                            conflict = true;
                            *key = extra;
                        }
                    }
                    _ => {}
                }
            }
        }
        if conflict {
            let fs = self.fs();
            let op = match v.kind {
                ExpKind::Local(_) => OpCode::Move,
                _ => OpCode::GetUpval,
            };
            let src = match v.kind {
                ExpKind::Local(r) | ExpKind::Upval(r) => r,
                _ => unreachable!("conflict sources are locals or upvalues"),
            };
            fs.code_abc(op, extra, src, 0);
            fs.reserve_regs(1)?;
        }
        Ok(())
    }

    fn assignment(&mut self, targets: &mut Vec<ExpDesc>) -> Result<(), SyntaxError> {
        if !Self::is_var_kind(targets.last().expect("one target").kind) {
            return self.error("syntax error");
        }
        if self.test_next(&Token::Comma)? {
            let v = self.suffixed_exp()?;
            if !matches!(v.kind, ExpKind::Indexed { .. }) {
                self.check_conflict(targets, &v)?;
            }
            self.check_limit(targets.len() + self.depth as usize, 120, "assignment targets")?;
            targets.push(v);
            return self.assignment(targets);
        }
        self.check_next(&Token::Assign)?;
        let nvars = targets.len() as u32;
        let (nexps, mut e) = self.exp_list()?;
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
        } else {
            self.fs().discharge_vars(&mut e); // close the last value
            let last = targets.pop().expect("one target");
            self.fs().store_var(&last, &mut e)?;
            return self.store_remaining(targets);
        }
        self.store_remaining(targets)
    }

    fn store_remaining(&mut self, targets: &mut Vec<ExpDesc>) -> Result<(), SyntaxError> {
        while let Some(t) = targets.pop() {
            let fs = self.fs();
            let mut e = ExpDesc::new(ExpKind::NonReloc(fs.freereg - 1));
            fs.store_var(&t, &mut e)?;
        }
        Ok(())
    }

    fn ret_stat(&mut self) -> Result<(), SyntaxError> {
        let fs_nactvar = self.fs().nactvar;
        let (first, nret);
        if self.block_follow(true) || self.tok == Token::Semicolon {
            first = 0;
            nret = 0;
        } else {
            let (n, mut e) = self.exp_list()?;
            if matches!(e.kind, ExpKind::Call(_) | ExpKind::Vararg(_)) {
                self.fs().set_multret(&e)?;
                if let ExpKind::Call(pc) = e.kind {
                    if n == 1 {
                        let fs = self.fs();
                        let ins = &mut fs.proto.code[pc as usize];
                        ins.set_opcode(OpCode::TailCall);
                        debug_assert_eq!(ins.a(), fs_nactvar);
                    }
                }
                first = fs_nactvar;
                nret = MULTRET;
            } else if n == 1 {
                first = self.fs().exp_to_any_reg(&mut e)?;
                nret = 1;
            } else {
                self.fs().exp_to_next_reg(&mut e)?;
                first = fs_nactvar;
                nret = (self.fs().freereg - first) as i32;
                debug_assert_eq!(nret, n as i32);
            }
        }
        self.fs().ret(first, nret);
        self.test_next(&Token::Semicolon)?;
        Ok(())
    }

    // ==================================================================
    // Expressions
    // ==================================================================

    fn exp_list(&mut self) -> Result<(u32, ExpDesc), SyntaxError> {
        let mut n: u32 = 1;
        let mut e = self.expression()?;
        while self.test_next(&Token::Comma)? {
            self.fs().exp_to_next_reg(&mut e)?;
            e = self.expression()?;
            n += 1;
        }
        Ok((n, e))
    }

    fn adjust_assign(&mut self, nvars: u32, nexps: u32, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        let fs = self.fs();
        let mut extra = nvars as i32 - nexps as i32;
        if matches!(e.kind, ExpKind::Call(_) | ExpKind::Vararg(_)) {
            extra += 1; // the expression itself provides one value
            if extra < 0 {
                extra = 0;
            }
            fs.set_returns(e, extra)?;
            if extra > 1 {
                fs.reserve_regs((extra - 1) as u32)?;
            }
        } else {
            if e.kind != ExpKind::Void {
                fs.exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let reg = fs.freereg;
                fs.reserve_regs(extra as u32)?;
                fs.nil(reg, extra as u32);
            }
        }
        if nexps > nvars {
            self.fs().freereg -= nexps - nvars;
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<ExpDesc, SyntaxError> {
        self.sub_expression(0).map(|(e, _)| e)
    }

    fn unary_op(&self) -> Option<UnOp> {
        match self.tok {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Minus),
            Token::Hash => Some(UnOp::Len),
            Token::Tilde => Some(UnOp::BNot),
            _ => None,
        }
    }

    fn binary_op(&self) -> Option<BinOp> {
        Some(match self.tok {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Percent => BinOp::Mod,
            Token::Caret => BinOp::Pow,
            Token::Slash => BinOp::Div,
            Token::DoubleSlash => BinOp::IDiv,
            Token::Ampersand => BinOp::BAnd,
            Token::Pipe => BinOp::BOr,
            Token::Tilde => BinOp::BXor,
            Token::ShiftL => BinOp::Shl,
            Token::ShiftR => BinOp::Shr,
            Token::Concat => BinOp::Concat,
            Token::NotEq => BinOp::Ne,
            Token::Eq => BinOp::Eq,
            Token::Less => BinOp::Lt,
            Token::LessEq => BinOp::Le,
            Token::Greater => BinOp::Gt,
            Token::GreaterEq => BinOp::Ge,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        })
    }

    /// Parse expressions with operators binding tighter than `limit`.
    /// Returns the expression and the first unconsumed operator.
    fn sub_expression(&mut self, limit: u8) -> Result<(ExpDesc, Option<BinOp>), SyntaxError> {
        self.enter_level()?;
        let mut e;
        if let Some(op) = self.unary_op() {
            let line = self.lx.line;
            self.next()?;
            let (mut operand, _) = self.sub_expression(UNARY_PRIORITY)?;
            self.fs().prefix(op, &mut operand, line)?;
            e = operand;
        } else {
            e = self.simple_exp()?;
        }
        let mut op = self.binary_op();
        while let Some(binop) = op {
            if binop.priority().0 <= limit {
                break;
            }
            let line = self.lx.line;
            self.next()?;
            self.fs().infix(binop, &mut e)?;
            let (mut e2, next_op) = self.sub_expression(binop.priority().1)?;
            self.fs().posfix(binop, &mut e, &mut e2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok((e, op))
    }

    fn simple_exp(&mut self) -> Result<ExpDesc, SyntaxError> {
        let e = match &self.tok {
            Token::Int(i) => ExpDesc::new(ExpKind::ConstInt(*i)),
            Token::Float(f) => ExpDesc::new(ExpKind::ConstFloat(*f)),
            Token::Str(_) => {
                let s = match std::mem::replace(&mut self.tok, Token::Eof) {
                    Token::Str(s) => s,
                    _ => unreachable!("just matched"),
                };
                let k = self.fs().string_k(&s)?;
                self.tok = Token::Str(Vec::new()); // placeholder; next() replaces it
                self.next()?;
                return Ok(ExpDesc::new(ExpKind::Const(k)));
            }
            Token::Nil => ExpDesc::new(ExpKind::Nil),
            Token::True => ExpDesc::new(ExpKind::True),
            Token::False => ExpDesc::new(ExpKind::False),
            Token::Ellipsis => {
                if !self.fs().proto.is_vararg {
                    return self.error("cannot use '...' outside a vararg function");
                }
                let pc = self.fs().code_abc(OpCode::VarArg, 0, 1, 0);
                ExpDesc::new(ExpKind::Vararg(pc))
            }
            Token::LBrace => return self.constructor(),
            Token::Function => {
                let line = self.lx.line;
                self.next()?;
                return self.body(false, line);
            }
            _ => return self.suffixed_exp(),
        };
        self.next()?;
        Ok(e)
    }

    fn primary_exp(&mut self) -> Result<ExpDesc, SyntaxError> {
        match &self.tok {
            Token::LParen => {
                let line = self.lx.line;
                self.next()?;
                let mut e = self.expression()?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                // Parentheses truncate multiple results to one.
                self.fs().discharge_vars(&mut e);
                Ok(e)
            }
            Token::Name(_) => self.single_var(),
            _ => self.error("unexpected symbol"),
        }
    }

    fn field_sel(&mut self, e: &mut ExpDesc) -> Result<(), SyntaxError> {
        self.fs().exp_to_any_reg_up(e)?;
        self.next()?; // skip '.' or ':'
        let name = self.check_name()?;
        let k = self.fs().string_k(&name)?;
        let mut key = ExpDesc::new(ExpKind::Const(k));
        self.fs().indexed(e, &mut key)
    }

    fn suffixed_exp(&mut self) -> Result<ExpDesc, SyntaxError> {
        let line = self.lx.line;
        let mut e = self.primary_exp()?;
        loop {
            match &self.tok {
                Token::Dot => self.field_sel(&mut e)?,
                Token::LBracket => {
                    self.fs().exp_to_any_reg_up(&mut e)?;
                    self.next()?;
                    let mut key = self.expression()?;
                    self.fs().exp_to_val(&mut key)?;
                    self.check_next(&Token::RBracket)?;
                    self.fs().indexed(&mut e, &mut key)?;
                }
                Token::Colon => {
                    self.next()?;
                    let name = self.check_name()?;
                    let k = self.fs().string_k(&name)?;
                    let mut key = ExpDesc::new(ExpKind::Const(k));
                    self.fs().self_op(&mut e, &mut key)?;
                    e = self.func_args(e, line)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    self.fs().exp_to_next_reg(&mut e)?;
                    e = self.func_args(e, line)?;
                }
                _ => return Ok(e),
            }
        }
    }

    fn func_args(&mut self, f: ExpDesc, line: u32) -> Result<ExpDesc, SyntaxError> {
        let mut args = match &self.tok {
            Token::LParen => {
                self.next()?;
                if self.tok == Token::RParen {
                    let e = ExpDesc::new(ExpKind::Void);
                    self.next()?;
                    e
                } else {
                    let (_, mut e) = self.exp_list()?;
                    if matches!(e.kind, ExpKind::Call(_) | ExpKind::Vararg(_)) {
                        self.fs().set_multret(&e)?;
                    }
                    self.check_match(&Token::RParen, &Token::LParen, line)?;
                    e
                }
            }
            Token::LBrace => self.constructor()?,
            Token::Str(_) => {
                let s = match std::mem::replace(&mut self.tok, Token::Eof) {
                    Token::Str(s) => s,
                    _ => unreachable!("just matched"),
                };
                let k = self.fs().string_k(&s)?;
                self.tok = Token::Str(Vec::new());
                self.next()?;
                ExpDesc::new(ExpKind::Const(k))
            }
            _ => return self.error("function arguments expected"),
        };
        let base = match f.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("callee was discharged to a register"),
        };
        let nparams = if matches!(args.kind, ExpKind::Call(_) | ExpKind::Vararg(_)) {
            self.fs().set_multret(&args)?;
            MULTRET
        } else {
            if args.kind != ExpKind::Void {
                self.fs().exp_to_next_reg(&mut args)?;
            }
            (self.fs().freereg - (base + 1)) as i32
        };
        let fs = self.fs();
        let pc = fs.code_abc(OpCode::Call, base, (nparams + 1) as u32, 2);
        fs.fix_line(line);
        fs.freereg = base + 1; // one result by default
        Ok(ExpDesc::new(ExpKind::Call(pc)))
    }

    // ==================================================================
    // Table constructors
    // ==================================================================

    fn constructor(&mut self) -> Result<ExpDesc, SyntaxError> {
        let line = self.lx.line;
        let pc = self.fs().code_abc(OpCode::NewTable, 0, 0, 0);
        let mut t = ExpDesc::new(ExpKind::Reloc(pc));
        self.fs().exp_to_next_reg(&mut t)?;
        let treg = match t.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("table is in a register"),
        };
        self.check_next(&Token::LBrace)?;
        let mut na: u32 = 0; // array items
        let mut nh: u32 = 0; // hash entries
        let mut to_store: u32 = 0; // array items not yet flushed
        let mut pending: Option<ExpDesc> = None;
        loop {
            if self.tok == Token::RBrace {
                break;
            }
            // Flush a full batch before starting the next field.
            if let Some(mut v) = pending.take() {
                self.fs().exp_to_next_reg(&mut v)?;
                if to_store == FIELDS_PER_FLUSH {
                    self.fs().set_list(treg, na, to_store as i32)?;
                    to_store = 0;
                }
            }
            match &self.tok {
                Token::Name(_) if self.lx.peek()? == &Token::Assign => {
                    let name = self.check_name()?;
                    let k = self.fs().string_k(&name)?;
                    let key = ExpDesc::new(ExpKind::Const(k));
                    self.rec_field(treg, key, &mut nh)?;
                }
                Token::LBracket => {
                    self.next()?;
                    let mut key = self.expression()?;
                    self.fs().exp_to_val(&mut key)?;
                    self.check_next(&Token::RBracket)?;
                    self.check_next(&Token::Assign)?;
                    self.rec_field(treg, key, &mut nh)?;
                }
                _ => {
                    let v = self.expression()?;
                    self.check_limit(na as usize, i32::MAX as usize, "items in a constructor")?;
                    na += 1;
                    to_store += 1;
                    pending = Some(v);
                }
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semicolon)? {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        // Last list field: an open call or vararg spreads into the
        // array part.
        if let Some(mut v) = pending {
            if matches!(v.kind, ExpKind::Call(_) | ExpKind::Vararg(_)) {
                self.fs().set_multret(&v)?;
                self.fs().set_list(treg, na, MULTRET)?;
                na -= 1; // the multi-value field does not count
            } else {
                if v.kind != ExpKind::Void {
                    self.fs().exp_to_next_reg(&mut v)?;
                }
                self.fs().set_list(treg, na, to_store as i32)?;
            }
        } else if to_store > 0 {
            self.fs().set_list(treg, na, to_store as i32)?;
        }
        let ins = &mut self.fs().proto.code[pc as usize];
        ins.set_b(int_to_fb(na));
        ins.set_c(int_to_fb(nh));
        Ok(t)
    }

    fn rec_field(&mut self, treg: u32, mut key: ExpDesc, nh: &mut u32) -> Result<(), SyntaxError> {
        self.check_limit(*nh as usize, i32::MAX as usize, "items in a constructor")?;
        *nh += 1;
        // The bracketed form consumed its '=' already.
        if self.tok == Token::Assign {
            self.next()?;
        }
        let free_before = self.fs().freereg;
        let rk_key = self.fs().exp_to_rk(&mut key)?;
        let mut val = self.expression()?;
        let rk_val = self.fs().exp_to_rk(&mut val)?;
        self.fs().code_abc(OpCode::SetTable, treg, rk_key, rk_val);
        self.fs().freereg = free_before;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selune_core::proto::Constant;

    fn compile(src: &str) -> ProtoDesc {
        parse(src.as_bytes(), b"=test").expect("compiles")
    }

    fn ops(p: &ProtoDesc) -> Vec<OpCode> {
        p.code.iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn empty_chunk_returns() {
        let p = compile("");
        assert_eq!(ops(&p), vec![OpCode::Return]);
        assert!(p.is_vararg);
        assert_eq!(p.upvalues.len(), 1);
        assert_eq!(p.upvalue_names[0], b"_ENV");
    }

    #[test]
    fn return_constant() {
        let p = compile("return 7");
        assert_eq!(ops(&p), vec![OpCode::LoadK, OpCode::Return, OpCode::Return]);
        assert_eq!(p.constants, vec![Constant::Int(7)]);
        // RETURN A=0 B=2: one value from register 0.
        assert_eq!(p.code[1].a(), 0);
        assert_eq!(p.code[1].b(), 2);
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let p = compile("return 2 + 3 * 4");
        assert_eq!(p.constants, vec![Constant::Int(14)]);
        let p = compile("return 7 // 2");
        assert_eq!(p.constants, vec![Constant::Int(3)]);
        let p = compile("return 1 / 2");
        assert_eq!(p.constants, vec![Constant::Float(0.5)]);
        // Division by zero does not fold; it must raise at run time.
        let p = compile("return 1 // 0");
        assert!(p.code.iter().any(|i| i.opcode() == OpCode::IDiv));
    }

    #[test]
    fn global_access_goes_through_env() {
        let p = compile("x = 1");
        assert_eq!(ops(&p), vec![OpCode::SetTabUp, OpCode::Return]);
        let p = compile("return x");
        assert_eq!(ops(&p)[0], OpCode::GetTabUp);
    }

    #[test]
    fn local_variables_use_registers() {
        let p = compile("local a = 1 local b = 2 return a + b");
        assert!(ops(&p).contains(&OpCode::Add));
        assert_eq!(p.loc_vars.len(), 2);
        assert_eq!(p.loc_vars[0].name, b"a");
        assert_eq!(p.max_stack_size as u32, 3);
    }

    #[test]
    fn call_statement_discards_results() {
        let p = compile("f()");
        let call = p.code.iter().find(|i| i.opcode() == OpCode::Call).unwrap();
        assert_eq!(call.c(), 1);
    }

    #[test]
    fn tail_call_in_return() {
        let p = compile("local function f() end return f()");
        assert!(ops(&p).contains(&OpCode::TailCall));
    }

    #[test]
    fn multiple_assignment_adjusts_values() {
        let p = compile("local a, b = 1");
        // Missing value becomes nil.
        assert!(ops(&p).contains(&OpCode::LoadNil));
        let p = compile("local a, b = f()");
        let call = p.code.iter().find(|i| i.opcode() == OpCode::Call).unwrap();
        assert_eq!(call.c(), 3); // two results requested
    }

    #[test]
    fn nested_function_captures_upvalue() {
        let p = compile("local x = 1 return function() return x end");
        assert_eq!(p.protos.len(), 1);
        let inner = &p.protos[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].in_stack);
        assert_eq!(inner.upvalues[0].index, 0);
        assert_eq!(inner.upvalue_names[0], b"x");
    }

    #[test]
    fn deep_capture_chains_through_middle_function() {
        let p = compile("local x = 1 return function() return function() return x end end");
        let mid = &p.protos[0];
        let inner = &mid.protos[0];
        // Middle function captures the stack slot; innermost chains to
        // the middle's upvalue.
        assert!(mid.upvalues.iter().any(|u| u.in_stack));
        assert!(inner.upvalues.iter().any(|u| !u.in_stack));
    }

    #[test]
    fn numeric_for_reserves_control_registers() {
        let p = compile("for i = 1, 10 do end");
        assert!(ops(&p).contains(&OpCode::ForPrep));
        assert!(ops(&p).contains(&OpCode::ForLoop));
        // index, limit, step, user variable
        assert!(p.loc_vars.len() >= 4);
    }

    #[test]
    fn generic_for_emits_tforcall() {
        let p = compile("for k, v in pairs(t) do end");
        assert!(ops(&p).contains(&OpCode::TForCall));
        assert!(ops(&p).contains(&OpCode::TForLoop));
    }

    #[test]
    fn and_or_short_circuit_with_jumps() {
        let p = compile("return a and b");
        assert!(ops(&p).contains(&OpCode::TestSet));
        let p = compile("if a or b then f() end");
        assert!(ops(&p).contains(&OpCode::Test));
    }

    #[test]
    fn comparisons_pair_with_jmp() {
        let p = compile("return 1 < x");
        let code = ops(&p);
        let lt = code.iter().position(|&o| o == OpCode::Lt).unwrap();
        assert_eq!(code[lt + 1], OpCode::Jmp);
    }

    #[test]
    fn table_constructor_sizes() {
        let p = compile("return {1, 2, 3, x = 4}");
        let nt = p.code.iter().find(|i| i.opcode() == OpCode::NewTable).unwrap();
        assert_eq!(selune_core::opcode::fb_to_int(nt.b()), 3);
        assert_eq!(selune_core::opcode::fb_to_int(nt.c()), 1);
        assert!(ops(&p).contains(&OpCode::SetList));
        assert!(ops(&p).contains(&OpCode::SetTable));
    }

    #[test]
    fn method_call_uses_self() {
        let p = compile("obj:method(1)");
        assert!(ops(&p).contains(&OpCode::SelfOp));
    }

    #[test]
    fn break_patches_out_of_loop() {
        let p = compile("while true do break end return 1");
        assert!(ops(&p).contains(&OpCode::Jmp));
    }

    #[test]
    fn goto_backward_and_forward() {
        compile("::top:: do goto top end");
        compile("do goto done end ::done::");
    }

    #[test]
    fn goto_into_local_scope_rejected() {
        let err = parse(b"goto skip local x ::skip:: return x", b"=t").unwrap_err();
        assert!(err.message.contains("jumps into the scope"), "{}", err.message);
    }

    #[test]
    fn undefined_goto_rejected() {
        let err = parse(b"goto nowhere", b"=t").unwrap_err();
        assert!(err.message.contains("no visible label"), "{}", err.message);
        let err = parse(b"break", b"=t").unwrap_err();
        assert!(err.message.contains("break outside a loop"), "{}", err.message);
    }

    #[test]
    fn repeated_label_rejected() {
        let err = parse(b"::a:: ::a::", b"=t").unwrap_err();
        assert!(err.message.contains("already defined"), "{}", err.message);
    }

    #[test]
    fn vararg_outside_vararg_function_rejected() {
        let err = parse(b"local f = function() return ... end", b"=t").unwrap_err();
        assert!(err.message.contains("outside a vararg function"), "{}", err.message);
    }

    #[test]
    fn syntax_error_reports_line_and_token() {
        let err = parse(b"local x =\nreturn", b"=t").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("near"), "{}", err.message);
    }

    #[test]
    fn unclosed_block_names_opening_line() {
        let err = parse(b"if x then\n\n\n", b"=t").unwrap_err();
        assert!(err.message.contains("to close 'if' at line 1"), "{}", err.message);
    }

    #[test]
    fn line_info_tracks_statements() {
        let p = compile("local a = 1\nlocal b = 2\nreturn a");
        assert_eq!(p.line_info.len(), p.code.len());
        assert!(p.line_info.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn repeat_until_sees_body_locals() {
        compile("repeat local done = true until done");
    }

    #[test]
    fn string_call_sugar() {
        let p = compile("print 'hi'");
        assert!(ops(&p).contains(&OpCode::Call));
    }

    #[test]
    fn concat_runs_fuse() {
        let p = compile("return 'a' .. 'b' .. 'c'");
        let concats = ops(&p).iter().filter(|&&o| o == OpCode::Concat).count();
        assert_eq!(concats, 1);
        let c = p.code.iter().find(|i| i.opcode() == OpCode::Concat).unwrap();
        assert_eq!(c.c() - c.b(), 2);
    }
}
