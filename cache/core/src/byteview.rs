//! Immutable view over cached bytes.

use bytes::Bytes;

use crate::lru::Weighted;

/// An immutable, cheaply cloneable view of a cached value.
///
/// Construction always copies the input, and [`to_vec`](ByteView::to_vec)
/// hands out a fresh copy, so neither the producer nor a consumer can
/// mutate bytes held by the cache. Equality is by content.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteView {
    bytes: Bytes,
}

impl ByteView {
    /// Copy `data` into a new view.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(data),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// A fresh owned copy of the bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// The value as UTF-8 text, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(data),
        }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        Self::copy_from_slice(data.as_bytes())
    }
}

impl From<Bytes> for ByteView {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Weighted for ByteView {
    fn weight(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteView({} bytes)", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_copies_its_input() {
        let mut source = b"abc".to_vec();
        let view = ByteView::copy_from_slice(&source);
        source[0] = b'z';
        assert_eq!(view.as_slice(), b"abc");
    }

    #[test]
    fn to_vec_hands_out_a_copy() {
        let view = ByteView::from("abc");
        let mut copy = view.to_vec();
        copy[0] = b'z';
        assert_eq!(view.as_slice(), b"abc");
    }

    #[test]
    fn equality_is_by_content() {
        assert_eq!(ByteView::from("abc"), ByteView::from(b"abc".to_vec()));
        assert_ne!(ByteView::from("abc"), ByteView::from("abd"));
    }

    #[test]
    fn weight_is_byte_length() {
        assert_eq!(ByteView::from("hello").weight(), 5);
        assert_eq!(ByteView::default().weight(), 0);
    }
}
