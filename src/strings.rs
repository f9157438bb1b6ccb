//! The string intern table.
//!
//! Grounded in `hpcprof::sinks::MetaDB::stringsTableLookup` (dedup keyed on
//! string content, returning a stable offset) and in how
//! `symbolic-sourcemapcache`/`symbolic-ppdb` use `watto::StringTable`
//! directly rather than hand-rolling their own dedup map.

use parking_lot::Mutex;
use watto::StringTable;

/// A deduplicating, concurrently-insertable string table.
///
/// `intern` can be called from multiple notification callbacks
/// concurrently (`spec.md` §5); `emit` is only ever called once, from the
/// single-threaded `write()` pass.
///
/// `watto::StringTable` has no read-only "already present" probe, so the
/// shared/exclusive lock split the original's `std::shared_mutex` affords
/// collapses here to a single exclusive `parking_lot::Mutex` around the
/// one `insert()` call — see DESIGN.md.
pub struct StringIntern {
    table: Mutex<StringTable>,
}

impl StringIntern {
    /// Creates an empty string table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(StringTable::new()),
        }
    }

    /// Interns `s`, returning a byte offset local to the eventual strings
    /// section. Equal inputs always return equal offsets.
    pub fn intern(&self, s: &str) -> u64 {
        self.table.lock().insert(s) as u64
    }

    /// Consumes the table, returning the concatenated, NUL-terminated,
    /// deduplicated string bytes ready to be placed by [`crate::scope::Written`].
    pub fn into_bytes(self) -> Vec<u8> {
        self.table.into_inner().into_bytes()
    }

    /// Takes the accumulated strings out of the table (leaving it empty)
    /// and returns the concatenated, NUL-terminated, deduplicated bytes.
    ///
    /// Used instead of [`into_bytes`](Self::into_bytes) by
    /// [`crate::Writer::write`], which only ever holds `&self` (strings may
    /// still be interned concurrently with entity registration up until
    /// this point, per `spec.md` §5).
    pub fn emit(&self) -> Vec<u8> {
        let mut guard = self.table.lock();
        let table = std::mem::replace(&mut *guard, StringTable::new());
        table.into_bytes()
    }
}

impl Default for StringIntern {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_intern_to_equal_offsets() {
        let table = StringIntern::new();
        let a = table.intern("hello");
        let b = table.intern("world");
        let c = table.intern("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn into_bytes_is_nul_terminated() {
        let table = StringIntern::new();
        let off = table.intern("abc");
        let bytes = table.into_bytes();
        assert_eq!(&bytes[off as usize..off as usize + 4], b"abc\0");
    }
}
