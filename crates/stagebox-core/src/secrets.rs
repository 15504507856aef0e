//! Zero-on-destroy byte buffers for staged state.
//!
//! A [`SecureBuffer`] owns the serialized form of one scope's staged state.
//! Its bytes are wiped when the buffer is explicitly destroyed and again
//! when it is dropped, so secret material does not linger in freed heap
//! memory.
//!
//! ## Security Properties
//!
//! - Serialization is sized up front, so the backing `Vec` is never
//!   reallocated and no partial copies are left behind in freed memory.
//! - `Debug` output shows only the length.
//! - Owners must call [`SecureBuffer::destroy`] before replacing a buffer;
//!   `Drop` is the backstop, not the contract.

use std::fmt;
use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use stagebox_macros::SecureZeroize;
use zeroize::Zeroize;

/// A heap buffer that is zeroed on [`destroy`](Self::destroy) and on drop.
#[derive(SecureZeroize)]
pub struct SecureBuffer {
    data: Vec<u8>,
}

impl SecureBuffer {
    /// Take ownership of `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Serialize `value` as JSON into an exactly-sized buffer.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, value)?;

        let mut data = Vec::with_capacity(counter.0);
        serde_json::to_writer(&mut data, value)?;
        Ok(Self { data })
    }

    /// Deserialize the buffer contents as JSON.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Borrow the raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wipe the contents. The buffer is empty afterwards.
    pub fn destroy(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("data", &"[REDACTED]")
            .field("len", &self.data.len())
            .finish()
    }
}

/// `io::Write` sink that only counts bytes.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_debug_redacts_contents() {
        let buf = SecureBuffer::new(b"super-secret-api-key".to_vec());
        let debug = format!("{buf:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("20"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_destroy_empties_buffer() {
        let mut buf = SecureBuffer::new(vec![0xAB; 64]);
        assert_eq!(buf.len(), 64);
        buf.destroy();
        assert!(buf.is_empty());
        assert!(buf.bytes().is_empty());
    }

    #[test]
    fn test_json_is_exactly_sized() {
        let mut value = BTreeMap::new();
        value.insert("name".to_string(), "x".repeat(1000));
        let buf = SecureBuffer::from_json(&value).unwrap();
        assert_eq!(buf.data.capacity(), buf.len());

        let back: BTreeMap<String, String> = buf.to_json().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_destroyed_buffer_no_longer_decodes() {
        let mut buf = SecureBuffer::from_json(&vec![1, 2, 3]).unwrap();
        buf.destroy();
        assert!(buf.to_json::<Vec<u8>>().is_err());
    }
}
