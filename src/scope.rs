//! The two-phase write device: reserve a place in the file, then either
//! commit bytes immediately ([`Written`]) or populate and commit them later
//! ([`WriteGuard`]).
//!
//! Grounded in `hpcprof::formats::core::{Written, WriteGuard}`
//! (`core.hpp`). The original also has `SubWritten`/`SubWriteGuard`
//! variants that additionally patch a parent struct on completion; here
//! that's just a plain field assignment at the call site in `writer.rs`
//! once `offset()`/`size()` are known, since there are only seven sections
//! and a generic `update_parent` hook would only obscure that.
//!
//! Unlike the C++ original, [`WriteGuard::finish`] is an explicit method
//! rather than something that happens in `Drop` — `Drop::drop` can't
//! return a `Result`, so a fallible commit has no good place to live
//! except an explicit call.

use std::io;

use crate::layout::{Layout, Sink};

/// A region of the output that has already been committed.
///
/// Carries only the coordinates of the write, not the bytes — once
/// constructed there's nothing left to do with it but read `offset()` and
/// `size()` back to patch a parent record.
#[derive(Debug, Clone, Copy)]
pub struct Written {
    offset: u64,
    size: u64,
}

impl Written {
    /// Reserves space for `bytes` in `layout` and writes them to `sink`
    /// immediately.
    pub fn write<S: Sink + ?Sized>(
        layout: &mut Layout,
        sink: &mut S,
        bytes: &[u8],
        align: u64,
    ) -> io::Result<Self> {
        let offset = layout.allocate(bytes.len() as u64, align);
        sink.write_at(offset, bytes)?;
        Ok(Self {
            offset,
            size: bytes.len() as u64,
        })
    }

    /// The offset this region was placed at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The number of bytes occupied by this region.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A region of the output whose space is reserved up front, but whose
/// contents are only known (and written) later.
///
/// This is what lets a parent record embed a child's offset before the
/// child's bytes exist: the parent's `WriteGuard` is constructed first (so
/// its offset is known), the children are written, and only then is the
/// parent populated with the children's offsets and committed via
/// [`finish`](Self::finish).
pub struct WriteGuard<T> {
    offset: u64,
    size: u64,
    /// The value being built up before commit. Public so call sites can
    /// patch fields into it directly (the parent-patching role
    /// `SubWriteGuard` plays in the original).
    pub data: T,
}

impl<T> WriteGuard<T> {
    /// Reserves `size` bytes aligned to `align` in `layout`, associating
    /// the reservation with `data` for later serialization.
    pub fn new(layout: &mut Layout, size: u64, align: u64, data: T) -> Self {
        let offset = layout.allocate(size, align);
        Self { offset, size, data }
    }

    /// The offset this region was reserved at. Valid as soon as the guard
    /// is constructed, long before `finish` is called.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The number of bytes reserved for this region.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Serializes `self.data` with `serialize` and writes the result at
    /// the reserved offset, returning the committed region's coordinates.
    ///
    /// `serialize` must produce exactly `size()` bytes; this is checked in
    /// debug builds.
    pub fn finish<S: Sink + ?Sized>(
        self,
        sink: &mut S,
        serialize: impl FnOnce(&T) -> Vec<u8>,
    ) -> io::Result<Written> {
        let bytes = serialize(&self.data);
        debug_assert_eq!(
            bytes.len() as u64,
            self.size,
            "WriteGuard::finish produced a different size than was reserved"
        );
        sink.write_at(self.offset, &bytes)?;
        Ok(Written {
            offset: self.offset,
            size: self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::NullSink;

    #[test]
    fn written_records_its_own_coordinates() {
        let mut layout = Layout::new();
        let mut sink = NullSink;
        let region = Written::write(&mut layout, &mut sink, &[1, 2, 3, 4], 4).unwrap();
        assert_eq!(region.offset(), 0);
        assert_eq!(region.size(), 4);
    }

    #[test]
    fn write_guard_offset_is_known_before_finish() {
        let mut layout = Layout::new();
        let guard: WriteGuard<u32> = WriteGuard::new(&mut layout, 4, 4, 0);
        let offset_before_finish = guard.offset();
        let mut sink = NullSink;
        let region = guard
            .finish(&mut sink, |data| data.to_le_bytes().to_vec())
            .unwrap();
        assert_eq!(offset_before_finish, region.offset());
    }
}
