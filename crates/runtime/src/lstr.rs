//! Heap strings and the short-string interner.
//!
//! Strings come in two forms behind one object type:
//!
//! - *Short* (length ≤ 40): interned in a global chained hash table, so
//!   equality is handle equality and the hash is computed eagerly.
//! - *Long*: heap-unique, compared by content; the hash is computed
//!   lazily the first time the string is used as a table key.
//!
//! A small direct-mapped cache in front of the interner short-circuits
//! repeated creation from the same host byte slice.

use crate::heap::{FIXED, GcHeader, GcObject, GcRef, Heap, ObjData, StrRef, WHITE_BITS};
use selune_core::limits::SHORT_STRING_MAX;

/// A heap string: immutable bytes plus interner bookkeeping.
#[derive(Debug)]
pub struct LStr {
    pub bytes: Box<[u8]>,
    pub long: bool,
    /// Valid only when `hashed`. Long strings hash on demand.
    pub hash: u32,
    pub hashed: bool,
    /// Next string in the interner bucket chain (short strings only).
    pub hnext: Option<GcRef>,
}

/// Seeded byte hash. Long inputs are sampled with a stride so hashing
/// stays O(1)-ish in length.
pub fn hash_bytes(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ bytes.len() as u32;
    let step = (bytes.len() >> 5) + 1;
    let mut l = bytes.len();
    while l >= step {
        h ^= h
            .wrapping_shl(5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[l - 1] as u32);
        l -= step;
    }
    h
}

const CACHE_SETS: usize = 53;
const CACHE_WAYS: usize = 2;

#[derive(Clone, Copy)]
struct CacheEntry {
    addr: usize,
    len: usize,
    string: StrRef,
}

/// The global string table: open hash with per-object chain links for
/// short strings, plus the host-API creation cache.
pub struct StringTable {
    buckets: Vec<Option<GcRef>>,
    /// Interned short-string count.
    pub nuse: usize,
    pub seed: u32,
    cache: [[Option<CacheEntry>; CACHE_WAYS]; CACHE_SETS],
}

impl StringTable {
    pub fn new(seed: u32) -> StringTable {
        StringTable {
            buckets: vec![None; 64],
            nuse: 0,
            seed,
            cache: [[None; CACHE_WAYS]; CACHE_SETS],
        }
    }

    /// Intern or allocate a string for `bytes`. The boolean reports
    /// whether a fresh object was allocated (the caller must link it
    /// into the GC's object list).
    pub fn new_string(
        &mut self,
        heap: &mut Heap,
        bytes: &[u8],
        current_white: u8,
    ) -> (StrRef, bool) {
        if bytes.len() <= SHORT_STRING_MAX {
            self.intern_short(heap, bytes, current_white)
        } else {
            let obj = GcObject {
                header: GcHeader { marked: current_white, next: None },
                data: ObjData::Str(LStr {
                    bytes: bytes.into(),
                    long: true,
                    hash: 0,
                    hashed: false,
                    hnext: None,
                }),
            };
            (StrRef(heap.insert(obj)), true)
        }
    }

    /// Cached front door for host-supplied slices: hits skip the
    /// interner entirely. Every hit is validated by content so address
    /// reuse cannot alias.
    pub fn new_string_cached(
        &mut self,
        heap: &mut Heap,
        bytes: &[u8],
        current_white: u8,
    ) -> (StrRef, bool) {
        let addr = bytes.as_ptr() as usize;
        let set = addr % CACHE_SETS;
        for way in 0..CACHE_WAYS {
            if let Some(e) = self.cache[set][way] {
                if e.addr == addr
                    && e.len == bytes.len()
                    && heap.contains(e.string.0)
                    && heap.str(e.string).bytes.as_ref() == bytes
                {
                    return (e.string, false);
                }
            }
        }
        let (s, fresh) = self.new_string(heap, bytes, current_white);
        // Shift ways: newest first.
        self.cache[set][1] = self.cache[set][0];
        self.cache[set][0] = Some(CacheEntry { addr, len: bytes.len(), string: s });
        (s, fresh)
    }

    fn intern_short(&mut self, heap: &mut Heap, bytes: &[u8], current_white: u8) -> (StrRef, bool) {
        let hash = hash_bytes(bytes, self.seed);
        let other_white = WHITE_BITS & !current_white;
        let bucket = hash as usize & (self.buckets.len() - 1);
        let mut cursor = self.buckets[bucket];
        while let Some(r) = cursor {
            let obj = heap.get(r);
            let s = match &obj.data {
                ObjData::Str(s) => s,
                _ => unreachable!("interner holds strings"),
            };
            if s.bytes.as_ref() == bytes {
                // Resurrect a string the current cycle already
                // condemned.
                if obj.header.is_dead(other_white & WHITE_BITS) {
                    heap.header_mut(r).make_white(current_white);
                }
                return (StrRef(r), false);
            }
            cursor = s.hnext;
        }
        if self.nuse >= self.buckets.len() {
            self.resize(heap, self.buckets.len() * 2);
        }
        let bucket = hash as usize & (self.buckets.len() - 1);
        let obj = GcObject {
            header: GcHeader { marked: current_white, next: None },
            data: ObjData::Str(LStr {
                bytes: bytes.into(),
                long: false,
                hash,
                hashed: true,
                hnext: self.buckets[bucket],
            }),
        };
        let r = heap.insert(obj);
        self.buckets[bucket] = Some(r);
        self.nuse += 1;
        (StrRef(r), true)
    }

    /// Rebuild the bucket array at `new_size` (a power of two).
    pub fn resize(&mut self, heap: &mut Heap, new_size: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![None; new_size]);
        for mut cursor in old {
            while let Some(r) = cursor {
                let s = match &mut heap.get_mut(r).data {
                    ObjData::Str(s) => s,
                    _ => unreachable!("interner holds strings"),
                };
                cursor = s.hnext.take();
                let bucket = s.hash as usize & (new_size - 1);
                s.hnext = self.buckets[bucket];
                self.buckets[bucket] = Some(r);
            }
        }
    }

    /// Unlink an interned string that is about to be swept.
    pub fn remove(&mut self, heap: &mut Heap, r: GcRef) {
        let (hash, next) = {
            let s = match &heap.get(r).data {
                ObjData::Str(s) => s,
                _ => unreachable!("interner holds strings"),
            };
            debug_assert!(!s.long);
            (s.hash, s.hnext)
        };
        let bucket = hash as usize & (self.buckets.len() - 1);
        if self.buckets[bucket] == Some(r) {
            self.buckets[bucket] = next;
            self.nuse -= 1;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while let Some(prev) = cursor {
            let prev_next = match &heap.get(prev).data {
                ObjData::Str(s) => s.hnext,
                _ => unreachable!("interner holds strings"),
            };
            if prev_next == Some(r) {
                match &mut heap.get_mut(prev).data {
                    ObjData::Str(s) => s.hnext = next,
                    _ => unreachable!("interner holds strings"),
                }
                self.nuse -= 1;
                return;
            }
            cursor = prev_next;
        }
        debug_assert!(false, "string not in its bucket");
    }

    /// Cache maintenance at a collection boundary: drop entries whose
    /// strings are about to be judged.
    pub fn clear_cache(&mut self) {
        for set in &mut self.cache {
            for way in set.iter_mut() {
                *way = None;
            }
        }
    }

    /// During GC the string-table shrink policy: halve while load is
    /// below one quarter.
    pub fn shrink_if_sparse(&mut self, heap: &mut Heap) {
        while self.buckets.len() > 64 && self.nuse < self.buckets.len() / 4 {
            let new_size = self.buckets.len() / 2;
            self.resize(heap, new_size);
        }
    }
}

/// Compare two heap strings for content equality. Short strings are
/// interned, so handle equality decides; long strings compare bytes.
pub fn str_eq(heap: &Heap, a: StrRef, b: StrRef) -> bool {
    if a == b {
        return true;
    }
    let sa = heap.str(a);
    let sb = heap.str(b);
    sa.long && sb.long && sa.bytes == sb.bytes
}

/// The hash of a string, forcing the lazy computation for long
/// strings.
pub fn force_hash(heap: &mut Heap, seed: u32, r: StrRef) -> u32 {
    let s = heap.str(r);
    if s.hashed {
        return s.hash;
    }
    let h = hash_bytes(&s.bytes, seed);
    let s = heap.str_mut(r);
    s.hash = h;
    s.hashed = true;
    h
}

/// Mark a string as uncollectable (metamethod names).
pub fn fix_string(heap: &mut Heap, r: StrRef) {
    heap.header_mut(r.0).marked |= FIXED;
}
