//! Scatter/gather I/O descriptor
//!
//! A `Uio` walks an ordered list of buffers left to right while tracking
//! the file offset and the bytes still to move. Reads fill `Uio<&mut [u8]>`,
//! writes drain `Uio<&[u8]>`.

use heapless::Vec;

use crate::error::{VmError, VmResult};

/// Maximum number of segments in one request
pub const UIO_MAXIOV: usize = 64;

/// Scatter/gather request
#[derive(Debug)]
pub struct Uio<B> {
    iov: Vec<B, UIO_MAXIOV>,
    /// Current segment
    idx: usize,
    /// Bytes already consumed from the current segment
    skip: usize,
    /// File offset of the next byte
    pub offset: u64,
    /// Bytes left to move
    pub resid: usize,
}

impl<B: AsRef<[u8]>> Uio<B> {
    /// Build a request over `iov` starting at file `offset`
    ///
    /// Fails with `InvalidArgument` on more than `UIO_MAXIOV` segments or a
    /// total length that overflows.
    pub fn new(iov: impl IntoIterator<Item = B>, offset: u64) -> VmResult<Self> {
        let mut segs = Vec::new();
        let mut resid: usize = 0;
        for seg in iov {
            resid = resid
                .checked_add(seg.as_ref().len())
                .ok_or(VmError::InvalidArgument)?;
            segs.push(seg).map_err(|_| VmError::InvalidArgument)?;
        }

        let mut uio = Self {
            iov: segs,
            idx: 0,
            skip: 0,
            offset,
            resid,
        };
        uio.settle();
        Ok(uio)
    }

    /// Unconsumed part of the current segment
    pub fn segment(&self) -> Option<&[u8]> {
        self.iov.get(self.idx).map(|seg| &seg.as_ref()[self.skip..])
    }

    /// Mark `n` bytes of the current segment as moved
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.resid);
        self.skip += n;
        self.resid -= n;
        self.offset += n as u64;
        self.settle();
    }

    /// Number of segments
    pub fn iovcnt(&self) -> usize {
        self.iov.len()
    }

    // Step past exhausted and empty segments
    fn settle(&mut self) {
        while let Some(seg) = self.iov.get(self.idx) {
            if self.skip < seg.as_ref().len() {
                break;
            }
            self.idx += 1;
            self.skip = 0;
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Uio<B> {
    /// Unconsumed part of the current segment, writable
    pub fn segment_mut(&mut self) -> Option<&mut [u8]> {
        let skip = self.skip;
        self.iov.get_mut(self.idx).map(|seg| &mut seg.as_mut()[skip..])
    }
}
