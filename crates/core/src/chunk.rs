//! Binary chunk dump and undump.
//!
//! The on-disk format is frozen: a fixed header that captures the
//! producing host's sizes and endianness, then the main function
//! serialized recursively. A loader seeing a mismatched header reports a
//! descriptive reason rather than guessing.
//!
//! Header layout:
//!
//! ```text
//! "\x1bLua"                     signature
//! version byte                  major * 16 + minor
//! format byte                   0
//! "\x19\x93\r\n\x1a\n"          conversion-damage test literal
//! sizeof int/size_t/Instruction/integer/number   (4, 8, 4, 8, 8)
//! 0x5678 as integer             endianness check
//! 370.5 as number               float format check
//! upvalue count of the main function
//! ```

use crate::opcode::{Instruction, OpCode};
use crate::proto::{Constant, LocVar, ProtoDesc, UpvalDesc};

pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION: u8 = VERSION_MAJOR * 16 + VERSION_MINOR;
pub const FORMAT: u8 = 0;
pub const CONV_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const CHECK_INT: i64 = 0x5678;
pub const CHECK_NUM: f64 = 370.5;

const SIZE_INT: u8 = 4;
const SIZE_SIZET: u8 = 8;
const SIZE_INSTR: u8 = 4;
const SIZE_INTEGER: u8 = 8;
const SIZE_NUMBER: u8 = 8;

// Constant-pool tags. The integer and long-string variants set bit 4 on
// the basic tag.
const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMFLT: u8 = 3;
const TAG_NUMINT: u8 = 0x13;
const TAG_SHRSTR: u8 = 4;
const TAG_LNGSTR: u8 = 0x14;

/// Why a chunk failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    NotAChunk,
    VersionMismatch(u8),
    FormatMismatch(u8),
    Corrupted(&'static str),
    Truncated,
    SizeMismatch(&'static str),
    EndiannessMismatch,
    FloatFormatMismatch,
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkError::NotAChunk => write!(f, "not a precompiled chunk"),
            ChunkError::VersionMismatch(v) => {
                write!(f, "version mismatch in precompiled chunk (got {v:#04x})")
            }
            ChunkError::FormatMismatch(v) => {
                write!(f, "format mismatch in precompiled chunk (got {v})")
            }
            ChunkError::Corrupted(what) => write!(f, "corrupted precompiled chunk ({what})"),
            ChunkError::Truncated => write!(f, "truncated precompiled chunk"),
            ChunkError::SizeMismatch(what) => {
                write!(f, "{what} size mismatch in precompiled chunk")
            }
            ChunkError::EndiannessMismatch => write!(f, "endianness mismatch in precompiled chunk"),
            ChunkError::FloatFormatMismatch => {
                write!(f, "float format mismatch in precompiled chunk")
            }
        }
    }
}

impl std::error::Error for ChunkError {}

// ======================================================================
// Dump
// ======================================================================

struct Writer {
    out: Vec<u8>,
    strip: bool,
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn bytes(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b);
    }

    fn int(&mut self, i: u32) {
        self.bytes(&i.to_ne_bytes());
    }

    fn integer(&mut self, i: i64) {
        self.bytes(&i.to_ne_bytes());
    }

    fn number(&mut self, n: f64) {
        self.bytes(&n.to_ne_bytes());
    }

    /// Strings are counted with a one-byte length offset by one; 0 marks
    /// an absent string and 0xFF escapes to a full size_t length.
    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.byte(0),
            Some(s) => {
                let n = s.len() as u64 + 1;
                if n < 0xFF {
                    self.byte(n as u8);
                } else {
                    self.byte(0xFF);
                    self.bytes(&n.to_ne_bytes());
                }
                self.bytes(s);
            }
        }
    }

    fn header(&mut self) {
        self.bytes(SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        self.bytes(CONV_DATA);
        self.byte(SIZE_INT);
        self.byte(SIZE_SIZET);
        self.byte(SIZE_INSTR);
        self.byte(SIZE_INTEGER);
        self.byte(SIZE_NUMBER);
        self.integer(CHECK_INT);
        self.number(CHECK_NUM);
    }

    fn function(&mut self, p: &ProtoDesc) {
        if self.strip || p.source.is_empty() {
            self.string(None);
        } else {
            self.string(Some(&p.source));
        }
        self.int(p.line_defined);
        self.int(p.last_line_defined);
        self.byte(p.num_params);
        self.byte(p.is_vararg as u8);
        self.byte(p.max_stack_size);
        self.int(p.code.len() as u32);
        for ins in &p.code {
            self.bytes(&ins.0.to_ne_bytes());
        }
        self.int(p.constants.len() as u32);
        for k in &p.constants {
            match k {
                Constant::Nil => self.byte(TAG_NIL),
                Constant::Bool(b) => {
                    self.byte(TAG_BOOL);
                    self.byte(*b as u8);
                }
                Constant::Float(n) => {
                    self.byte(TAG_NUMFLT);
                    self.number(*n);
                }
                Constant::Int(i) => {
                    self.byte(TAG_NUMINT);
                    self.integer(*i);
                }
                Constant::Str(s) => {
                    self.byte(if s.len() <= crate::limits::SHORT_STRING_MAX {
                        TAG_SHRSTR
                    } else {
                        TAG_LNGSTR
                    });
                    self.string(Some(s));
                }
            }
        }
        self.int(p.upvalues.len() as u32);
        for uv in &p.upvalues {
            self.byte(uv.in_stack as u8);
            self.byte(uv.index);
        }
        self.int(p.protos.len() as u32);
        for sub in &p.protos {
            self.function(sub);
        }
        // Debug block.
        if self.strip {
            self.int(0);
            self.int(0);
            self.int(0);
        } else {
            self.int(p.line_info.len() as u32);
            for line in &p.line_info {
                self.int(*line);
            }
            self.int(p.loc_vars.len() as u32);
            for lv in &p.loc_vars {
                self.string(Some(&lv.name));
                self.int(lv.start_pc);
                self.int(lv.end_pc);
            }
            self.int(p.upvalue_names.len() as u32);
            for name in &p.upvalue_names {
                self.string(Some(name));
            }
        }
    }
}

/// Serialize a function to the binary chunk format. With `strip`, debug
/// information (source name, line info, variable names) is omitted.
pub fn dump_chunk(main: &ProtoDesc, strip: bool) -> Vec<u8> {
    let mut w = Writer { out: Vec::new(), strip };
    w.header();
    w.byte(main.upvalues.len() as u8);
    w.function(main);
    w.out
}

// ======================================================================
// Undump
// ======================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + n > self.data.len() {
            return Err(ChunkError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn byte(&mut self) -> Result<u8, ChunkError> {
        Ok(self.take(1)?[0])
    }

    fn int(&mut self) -> Result<u32, ChunkError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes(b.try_into().expect("4 bytes")))
    }

    fn integer(&mut self) -> Result<i64, ChunkError> {
        let b = self.take(8)?;
        Ok(i64::from_ne_bytes(b.try_into().expect("8 bytes")))
    }

    fn number(&mut self) -> Result<f64, ChunkError> {
        let b = self.take(8)?;
        Ok(f64::from_ne_bytes(b.try_into().expect("8 bytes")))
    }

    fn string(&mut self) -> Result<Option<Vec<u8>>, ChunkError> {
        let first = self.byte()?;
        let n = match first {
            0 => return Ok(None),
            0xFF => {
                let b = self.take(8)?;
                u64::from_ne_bytes(b.try_into().expect("8 bytes"))
            }
            b => b as u64,
        };
        if n == 0 {
            return Err(ChunkError::Corrupted("string size"));
        }
        let len = (n - 1) as usize;
        Ok(Some(self.take(len)?.to_vec()))
    }

    fn header(&mut self) -> Result<(), ChunkError> {
        if self.take(4).map_err(|_| ChunkError::NotAChunk)? != SIGNATURE {
            return Err(ChunkError::NotAChunk);
        }
        let version = self.byte()?;
        if version != VERSION {
            return Err(ChunkError::VersionMismatch(version));
        }
        let format = self.byte()?;
        if format != FORMAT {
            return Err(ChunkError::FormatMismatch(format));
        }
        if self.take(6)? != CONV_DATA {
            return Err(ChunkError::Corrupted("conversion data"));
        }
        for (size, what) in [
            (SIZE_INT, "int"),
            (SIZE_SIZET, "size_t"),
            (SIZE_INSTR, "instruction"),
            (SIZE_INTEGER, "integer"),
            (SIZE_NUMBER, "number"),
        ] {
            if self.byte()? != size {
                return Err(ChunkError::SizeMismatch(what));
            }
        }
        if self.integer()? != CHECK_INT {
            return Err(ChunkError::EndiannessMismatch);
        }
        if self.number()? != CHECK_NUM {
            return Err(ChunkError::FloatFormatMismatch);
        }
        Ok(())
    }

    fn function(&mut self, depth: u32) -> Result<ProtoDesc, ChunkError> {
        if depth > 200 {
            return Err(ChunkError::Corrupted("proto nesting"));
        }
        let mut p = ProtoDesc {
            source: self.string()?.unwrap_or_default(),
            line_defined: self.int()?,
            last_line_defined: self.int()?,
            num_params: self.byte()?,
            is_vararg: self.byte()? != 0,
            max_stack_size: self.byte()?,
            ..ProtoDesc::default()
        };
        let ncode = self.int()? as usize;
        p.code.reserve(ncode.min(1 << 20));
        for _ in 0..ncode {
            let b = self.take(4)?;
            let ins = Instruction(u32::from_ne_bytes(b.try_into().expect("4 bytes")));
            if OpCode::from_u8(ins.raw_opcode()).is_none() {
                return Err(ChunkError::Corrupted("opcode"));
            }
            p.code.push(ins);
        }
        let nconst = self.int()? as usize;
        for _ in 0..nconst {
            let k = match self.byte()? {
                TAG_NIL => Constant::Nil,
                TAG_BOOL => Constant::Bool(self.byte()? != 0),
                TAG_NUMFLT => Constant::Float(self.number()?),
                TAG_NUMINT => Constant::Int(self.integer()?),
                TAG_SHRSTR | TAG_LNGSTR => {
                    Constant::Str(self.string()?.ok_or(ChunkError::Corrupted("constant"))?)
                }
                _ => return Err(ChunkError::Corrupted("constant tag")),
            };
            p.constants.push(k);
        }
        let nupvals = self.int()? as usize;
        for _ in 0..nupvals {
            p.upvalues.push(UpvalDesc {
                in_stack: self.byte()? != 0,
                index: self.byte()?,
            });
        }
        let nprotos = self.int()? as usize;
        for _ in 0..nprotos {
            p.protos.push(self.function(depth + 1)?);
        }
        let nlines = self.int()? as usize;
        for _ in 0..nlines {
            p.line_info.push(self.int()?);
        }
        let nlocs = self.int()? as usize;
        for _ in 0..nlocs {
            p.loc_vars.push(LocVar {
                name: self.string()?.unwrap_or_default(),
                start_pc: self.int()?,
                end_pc: self.int()?,
            });
        }
        let nupnames = self.int()? as usize;
        for _ in 0..nupnames {
            p.upvalue_names.push(self.string()?.unwrap_or_default());
        }
        Ok(p)
    }
}

/// Deserialize a binary chunk. `data` must start at the signature byte.
pub fn undump_chunk(data: &[u8]) -> Result<ProtoDesc, ChunkError> {
    let mut r = Reader { data, pos: 0 };
    r.header()?;
    let declared_upvals = r.byte()? as usize;
    let main = r.function(0)?;
    if main.upvalues.len() != declared_upvals {
        return Err(ChunkError::Corrupted("upvalue count"));
    }
    Ok(main)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{Instruction, OpCode};

    fn sample() -> ProtoDesc {
        ProtoDesc {
            num_params: 0,
            is_vararg: true,
            max_stack_size: 2,
            code: vec![
                Instruction::abx(OpCode::LoadK, 0, 0),
                Instruction::abc(OpCode::Return, 0, 2, 0),
                Instruction::abc(OpCode::Return, 0, 1, 0),
            ],
            constants: vec![
                Constant::Int(42),
                Constant::Float(370.5),
                Constant::Str(b"answer".to_vec()),
                Constant::Str(vec![b'x'; 100]),
                Constant::Bool(true),
                Constant::Nil,
            ],
            upvalues: vec![UpvalDesc { in_stack: true, index: 0 }],
            upvalue_names: vec![b"_ENV".to_vec()],
            line_info: vec![1, 1, 1],
            source: b"@sample.sel".to_vec(),
            line_defined: 0,
            last_line_defined: 0,
            ..ProtoDesc::default()
        }
    }

    #[test]
    fn round_trip() {
        let p = sample();
        let bin = dump_chunk(&p, false);
        assert_eq!(&bin[..4], SIGNATURE);
        let back = undump_chunk(&bin).expect("round trip");
        assert_eq!(back, p);
    }

    #[test]
    fn round_trip_stripped() {
        let p = sample();
        let bin = dump_chunk(&p, true);
        let back = undump_chunk(&bin).expect("round trip");
        assert!(back.line_info.is_empty());
        assert!(back.source.is_empty());
        assert_eq!(back.code, p.code);
        assert_eq!(back.constants, p.constants);
    }

    #[test]
    fn nested_protos_round_trip() {
        let mut p = sample();
        p.protos.push(sample());
        p.protos[0].protos.push(sample());
        let back = undump_chunk(&dump_chunk(&p, false)).expect("round trip");
        assert_eq!(back, p);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(undump_chunk(b"hello world"), Err(ChunkError::NotAChunk));
        assert_eq!(undump_chunk(b"\x1bLu"), Err(ChunkError::NotAChunk));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bin = dump_chunk(&sample(), false);
        bin[4] = 0x53;
        assert!(matches!(undump_chunk(&bin), Err(ChunkError::VersionMismatch(0x53))));
    }

    #[test]
    fn rejects_truncation() {
        let bin = dump_chunk(&sample(), false);
        for cut in [5, 16, 30, bin.len() - 1] {
            assert!(undump_chunk(&bin[..cut]).is_err());
        }
    }

    #[test]
    fn rejects_bad_opcode() {
        let p = sample();
        let bin = dump_chunk(&p, false);
        // Find the first instruction word and clobber its opcode field.
        let needle = p.code[0].0.to_ne_bytes();
        let at = bin
            .windows(4)
            .position(|w| w == needle)
            .expect("code present");
        let mut bad = bin.clone();
        bad[at] = 0x3F;
        assert_eq!(undump_chunk(&bad), Err(ChunkError::Corrupted("opcode")));
    }

    #[test]
    fn long_string_size_escape() {
        let mut p = sample();
        p.constants = vec![Constant::Str(vec![b'y'; 300])];
        let back = undump_chunk(&dump_chunk(&p, false)).expect("round trip");
        assert_eq!(back.constants, p.constants);
    }
}
