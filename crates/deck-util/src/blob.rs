use std::fmt;
use std::ops::Deref;

use base64::Engine;
use sha1::Digest as _;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("input is not valid base64")]
    InvalidBase64,
    #[error("input is not valid hex: {0}")]
    InvalidHex(String),
    #[error("random source failed: {0}")]
    Random(String),
}

/// Owned, growable byte buffer. Moveable but deliberately not `Clone`;
/// callers copy with [`Blob::from_slice`] when they need a second owner.
#[derive(Default, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Blob {
            data: Vec::with_capacity(n),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Blob {
            data: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn push(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Ensures room for at least `n` bytes in total. Never shrinks.
    pub fn reserve(&mut self, n: usize) {
        if n > self.data.capacity() {
            self.data.reserve_exact(n - self.data.len());
        }
    }

    /// Drops `k` bytes from the head; `k >= len` empties the blob.
    pub fn pop_front(&mut self, k: usize) {
        if k >= self.data.len() {
            self.data.clear();
        } else {
            self.data.drain(..k);
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.data)
    }

    pub fn from_hex(s: &str) -> Result<Self, BlobError> {
        Ok(Blob {
            data: from_hex(s)?,
        })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn from_base64(s: &str) -> Result<Self, BlobError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| BlobError::InvalidBase64)?;
        Ok(Blob { data })
    }

    pub fn sha1(&self) -> [u8; 20] {
        sha1::Sha1::digest(&self.data).into()
    }

    pub fn sha256(&self) -> [u8; 32] {
        sha2::Sha256::digest(&self.data).into()
    }

    pub fn random(n: usize) -> Result<Self, BlobError> {
        let mut data = vec![0u8; n];
        getrandom::getrandom(&mut data).map_err(|e| BlobError::Random(e.to_string()))?;
        Ok(Blob { data })
    }
}

impl Deref for Blob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Blob { data }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.data.len())
    }
}

/// Blob plus a read cursor for streaming consumption.
#[derive(Debug, Default)]
pub struct BlobBuffer {
    blob: Blob,
    cursor: usize,
}

impl BlobBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blob(blob: Blob) -> Self {
        BlobBuffer { blob, cursor: 0 }
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.blob.append(bytes);
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.blob.as_slice()[self.cursor..]
    }

    pub fn remaining_len(&self) -> usize {
        self.blob.len() - self.cursor
    }

    pub fn is_consumed(&self) -> bool {
        self.cursor >= self.blob.len()
    }

    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.blob.len());
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Drops consumed bytes so the cursor returns to the head.
    pub fn compact(&mut self) {
        self.blob.pop_front(self.cursor);
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.blob.clear();
        self.cursor = 0;
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, BlobError> {
    let s = s.trim().as_bytes();
    if s.len() % 2 != 0 {
        return Err(BlobError::InvalidHex("odd number of digits".to_string()));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for (i, pair) in s.chunks_exact(2).enumerate() {
        let (Some(hi), Some(lo)) = (hex_digit(pair[0]), hex_digit(pair[1])) else {
            return Err(BlobError::InvalidHex(format!(
                "non-hex digit at offset {}",
                i * 2
            )));
        };
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_never_shrinks() {
        let mut b = Blob::from_slice(b"hello world");
        let cap = b.capacity();
        b.reserve(2);
        assert!(b.capacity() >= cap);
        assert_eq!(b.len(), 11);
        b.reserve(4096);
        assert!(b.capacity() >= 4096);
        assert_eq!(b.as_slice(), b"hello world");
    }

    #[test]
    fn pop_front_past_end_empties() {
        let mut b = Blob::from_slice(b"abcdef");
        b.pop_front(2);
        assert_eq!(b.as_slice(), b"cdef");
        b.pop_front(100);
        assert!(b.is_empty());
    }

    #[test]
    fn hex_is_lowercase_and_reversible() {
        let b = Blob::from_slice(&[0x00, 0xab, 0xff, 0x10]);
        assert_eq!(b.to_hex(), "00abff10");
        assert_eq!(Blob::from_hex("00ABff10").unwrap(), b);
        assert!(Blob::from_hex("abc").is_err());
        assert!(Blob::from_hex("zz").is_err());
    }

    #[test]
    fn base64_rejects_garbage() {
        let b = Blob::from_slice(b"\x00\x01binary\xff");
        let enc = b.to_base64();
        assert_eq!(Blob::from_base64(&enc).unwrap(), b);
        assert_eq!(Blob::from_base64("!!!"), Err(BlobError::InvalidBase64));
    }

    #[test]
    fn known_digests() {
        let b = Blob::from_slice(b"abc");
        assert_eq!(to_hex(&b.sha1()), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            to_hex(&b.sha256()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_has_requested_length() {
        assert_eq!(Blob::random(16).unwrap().len(), 16);
    }

    #[test]
    fn buffer_cursor_streams_and_rewinds() {
        let mut buf = BlobBuffer::from_blob(Blob::from_slice(b"GET / HTTP/1.1"));
        buf.advance(4);
        assert_eq!(buf.remaining(), b"/ HTTP/1.1");
        buf.advance(1000);
        assert!(buf.is_consumed());
        buf.rewind();
        assert_eq!(buf.remaining_len(), 14);
        buf.advance(4);
        buf.compact();
        assert_eq!(buf.remaining(), b"/ HTTP/1.1");
    }
}
