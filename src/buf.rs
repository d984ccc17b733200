//! Fixed-capacity packet buffers and scatter assembly.
//!
//! A [`Buf`] is a 16 KiB buffer sized to hold any fully assembled packet.
//! Incoming datagrams are wrapped in `Arc<Buf>` so the defragmenter and the
//! decode stage can hold the same bytes concurrently; a buffer is never
//! mutated once it has a second holder. Decoding always writes into a fresh
//! `Buf` owned by the decode stage alone.
//!
//! [`PacketVector`] is the ordered list of fragment slices (head first) that
//! represents a packet before authentication. Its [`merge_map`] streams the
//! payload through a stateful transform so that decryption and MAC
//! computation happen in a single pass over the fragments.
//!
//! [`merge_map`]: PacketVector::merge_map

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use thiserror::Error;

/// Size of a packet buffer. Large enough for the biggest assembled packet.
pub const BUF_MEM_SIZE: usize = 16384;

/// Errors from buffer assembly and cursor I/O.
#[derive(Debug, Error)]
pub enum BufError {
    #[error("assembled packet of {0} bytes exceeds buffer capacity")]
    Overflow(usize),

    #[error("read past end of buffer at offset {0}")]
    ReadOverrun(usize),

    #[error("write past end of buffer at offset {0}")]
    WriteOverrun(usize),
}

/// A fixed-capacity byte buffer sized for one assembled packet.
pub struct Buf {
    data: Box<[u8; BUF_MEM_SIZE]>,
}

impl Buf {
    /// Allocate a new zeroed buffer.
    pub fn new() -> Self {
        let data: Box<[u8; BUF_MEM_SIZE]> = vec![0u8; BUF_MEM_SIZE]
            .into_boxed_slice()
            .try_into()
            .expect("boxed slice has BUF_MEM_SIZE elements");
        Self { data }
    }

    /// Allocate a buffer holding a copy of `bytes` (which must fit).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufError> {
        if bytes.len() > BUF_MEM_SIZE {
            return Err(BufError::Overflow(bytes.len()));
        }
        let mut b = Self::new();
        b.data[..bytes.len()].copy_from_slice(bytes);
        Ok(b)
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Buf {
    type Target = [u8; BUF_MEM_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// A stateful byte-stream transform applied during [`PacketVector::merge_map`].
///
/// `apply` is handed matching destination and source windows of equal length
/// and must fill the destination completely. Implementations carry cipher and
/// MAC state across calls, so the transform is independent of how the packet
/// happened to be fragmented.
pub trait StreamTransform {
    fn apply(&mut self, dst: &mut [u8], src: &[u8]);
}

/// One fragment's view into a shared buffer: bytes `start..end` of `buf`.
#[derive(Clone)]
pub struct Slice {
    pub buf: Arc<Buf>,
    pub start: usize,
    pub end: usize,
}

impl Slice {
    pub fn new(buf: Arc<Buf>, start: usize, end: usize) -> Self {
        Self { buf, start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }
}

/// Ordered sequence of fragment slices forming one packet, head first.
#[derive(Default)]
pub struct PacketVector {
    slices: Vec<Slice>,
}

impl PacketVector {
    pub fn new() -> Self {
        Self { slices: Vec::new() }
    }

    /// Wrap a single whole packet without copying.
    pub fn single(buf: Arc<Buf>, start: usize, end: usize) -> Self {
        Self {
            slices: vec![Slice::new(buf, start, end)],
        }
    }

    pub fn push(&mut self, slice: Slice) {
        self.slices.push(slice);
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Total byte size of the assembled packet.
    pub fn total_size(&self) -> usize {
        self.slices.iter().map(Slice::len).sum()
    }

    /// The head slice, which carries the cleartext packet header.
    pub fn head(&self) -> Option<&Slice> {
        self.slices.first()
    }

    /// Concatenate all slices into `dst`, returning the assembled size.
    pub fn merge_copy(&self, dst: &mut Buf) -> Result<usize, BufError> {
        let total = self.total_size();
        if total > BUF_MEM_SIZE {
            return Err(BufError::Overflow(total));
        }
        let mut at = 0;
        for s in &self.slices {
            dst[at..at + s.len()].copy_from_slice(s.as_bytes());
            at += s.len();
        }
        Ok(total)
    }

    /// Concatenate into `dst`, streaming bytes through `transform`.
    ///
    /// The first `hdr_prefix_len` bytes of the assembled packet are the
    /// cleartext header and are copied verbatim; every byte after that is
    /// fed through the transform. Cipher and MAC state live inside the
    /// transform, so the result does not depend on fragment boundaries.
    pub fn merge_map<T: StreamTransform>(
        &self,
        dst: &mut Buf,
        hdr_prefix_len: usize,
        transform: &mut T,
    ) -> Result<usize, BufError> {
        let total = self.total_size();
        if total > BUF_MEM_SIZE {
            return Err(BufError::Overflow(total));
        }
        let mut at = 0;
        let mut hdr_remaining = hdr_prefix_len;
        for s in &self.slices {
            let mut src = s.as_bytes();
            if hdr_remaining > 0 {
                let hdr = hdr_remaining.min(src.len());
                dst[at..at + hdr].copy_from_slice(&src[..hdr]);
                hdr_remaining -= hdr;
                at += hdr;
                src = &src[hdr..];
            }
            if !src.is_empty() {
                transform.apply(&mut dst[at..at + src.len()], src);
                at += src.len();
            }
        }
        Ok(total)
    }
}

impl std::ops::Index<usize> for PacketVector {
    type Output = Slice;

    fn index(&self, i: usize) -> &Slice {
        &self.slices[i]
    }
}

/// Bounds-checked reader over an assembled packet.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8, BufError> {
        let b = self.read_bytes(1)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BufError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, BufError> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], BufError> {
        if self.pos + n > self.data.len() {
            return Err(BufError::ReadOverrun(self.pos));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BufError> {
        self.read_bytes(n).map(|_| ())
    }
}

/// Bounds-checked writer for building packets in place.
pub struct Writer<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(data: &'a mut [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), BufError> {
        self.write_bytes(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), BufError> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), BufError> {
        self.write_bytes(&v.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BufError> {
        if self.pos + bytes.len() > self.data.len() {
            return Err(BufError::WriteOverrun(self.pos));
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorTransform(u8);

    impl StreamTransform for XorTransform {
        fn apply(&mut self, dst: &mut [u8], src: &[u8]) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = *s ^ self.0;
            }
        }
    }

    fn slice_of(bytes: &[u8]) -> Slice {
        let buf = Arc::new(Buf::from_bytes(bytes).unwrap());
        Slice::new(buf, 0, bytes.len())
    }

    #[test]
    fn merge_copy_concatenates_in_order() {
        let mut pv = PacketVector::new();
        pv.push(slice_of(b"head"));
        pv.push(slice_of(b"-mid-"));
        pv.push(slice_of(b"tail"));

        let mut dst = Buf::new();
        let n = pv.merge_copy(&mut dst).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&dst[..n], b"head-mid-tail");
    }

    #[test]
    fn merge_map_copies_prefix_verbatim() {
        let mut pv = PacketVector::new();
        pv.push(slice_of(&[1, 2, 3]));
        pv.push(slice_of(&[4, 5, 6, 7]));

        let mut dst = Buf::new();
        let n = pv.merge_map(&mut dst, 5, &mut XorTransform(0xff)).unwrap();
        assert_eq!(n, 7);
        // First 5 bytes verbatim (prefix spans both slices), rest transformed.
        assert_eq!(&dst[..n], &[1, 2, 3, 4, 5, !6, !7]);
    }

    #[test]
    fn merge_map_result_independent_of_fragmentation() {
        let payload: Vec<u8> = (0u8..100).collect();

        let mut one = PacketVector::new();
        one.push(slice_of(&payload));
        let mut a = Buf::new();
        one.merge_map(&mut a, 10, &mut XorTransform(0x5a)).unwrap();

        let mut many = PacketVector::new();
        many.push(slice_of(&payload[..7]));
        many.push(slice_of(&payload[7..40]));
        many.push(slice_of(&payload[40..]));
        let mut b = Buf::new();
        many.merge_map(&mut b, 10, &mut XorTransform(0x5a)).unwrap();

        assert_eq!(&a[..100], &b[..100]);
    }

    #[test]
    fn reader_rejects_overrun() {
        let data = [0u8; 4];
        let mut r = Reader::new(&data, 0);
        assert!(r.read_u16().is_ok());
        assert!(r.read_u64().is_err());
    }

    #[test]
    fn writer_rejects_overrun() {
        let mut data = [0u8; 4];
        let mut w = Writer::new(&mut data, 0);
        assert!(w.write_u16(7).is_ok());
        assert!(w.write_u64(7).is_err());
    }
}
