//! Frame type and pluggable `Marshaller`s (spec GLOSSARY, §4.6, §5.4)
//!
//! A marshaller here is a `write(payload, buffer) -> committed_bytes` /
//! `read(bytes) -> payload` pair operating on a plain `&mut [u8]`
//! scratch buffer rather than a bespoke writer trait object — the
//! "amortized write buffer of `max_frame_size` bytes" in spec §4.6 is
//! reset and reused by the send-loop, so a slice is all a marshaller
//! ever needs. The glossary's `on_dispose` half of `read` is just
//! `Drop` on the returned payload in Rust, so it is not modeled
//! separately.

use bytes::Bytes;
use std::net::SocketAddr;

use socketpipe_core::error::{Error, Result};

/// One received (or about-to-be-sent) application-level datagram
/// message.
#[derive(Debug, Clone)]
pub struct Frame<T> {
    pub payload: T,
    /// Monotonically increasing per-channel receive order (spec's
    /// "local index").
    pub local_index: u64,
    /// The peer a server-mode channel received this frame from, or sent
    /// it to.
    pub peer: Option<SocketAddr>,
    /// Opaque per-frame socket flags (spec's datagram metadata field).
    /// `compio`'s `send`/`send_to`/`recv`/`recv_from` expose no raw
    /// `SocketFlags`-equivalent knob, so this always round-trips as `0`
    /// on this platform; it exists so callers migrating frame metadata
    /// from a richer transport are not forced to drop the field.
    pub flags: i32,
}

/// A pluggable encode/decode pair for one datagram's payload.
pub trait Marshaller: Send + Sync + 'static {
    type Payload: Send + 'static;

    /// Encode `payload` into `buffer`, returning the number of bytes
    /// committed. Returning `0` tells the send-loop to drop the frame
    /// (spec §4.6 step 3, §8 "empty-payload frame").
    fn write(&self, payload: &Self::Payload, buffer: &mut [u8]) -> Result<usize>;

    /// Decode a complete datagram's bytes into a payload.
    fn read(&self, bytes: &[u8]) -> Result<Self::Payload>;
}

fn check_fits(len: usize, capacity: usize) -> Result<()> {
    if len > capacity {
        Err(Error::argument_out_of_range(format!(
            "payload of {len} bytes exceeds the {capacity}-byte frame buffer"
        )))
    } else {
        Ok(())
    }
}

/// Identity passthrough of raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesMarshaller;

impl Marshaller for BytesMarshaller {
    type Payload = Bytes;

    fn write(&self, payload: &Bytes, buffer: &mut [u8]) -> Result<usize> {
        check_fits(payload.len(), buffer.len())?;
        buffer[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// UTF-8 string payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8StringMarshaller;

impl Marshaller for Utf8StringMarshaller {
    type Payload = String;

    fn write(&self, payload: &String, buffer: &mut [u8]) -> Result<usize> {
        let bytes = payload.as_bytes();
        check_fits(bytes.len(), buffer.len())?;
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::invalid_operation(format!("frame is not valid UTF-8: {e}")))
    }
}

/// Integers formatted as UTF-8 decimal text (spec S3: the value `3`
/// travels as the single byte `0x33`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Int32Marshaller;

impl Marshaller for Utf8Int32Marshaller {
    type Payload = i32;

    fn write(&self, payload: &i32, buffer: &mut [u8]) -> Result<usize> {
        let text = payload.to_string();
        let bytes = text.as_bytes();
        check_fits(bytes.len(), buffer.len())?;
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<i32> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::invalid_operation("frame is not a UTF-8 decimal int32"))
    }
}

/// A `Vec<char>` payload, encoded as its UTF-8 text form.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharMemoryMarshaller;

impl Marshaller for CharMemoryMarshaller {
    type Payload = Vec<char>;

    fn write(&self, payload: &Vec<char>, buffer: &mut [u8]) -> Result<usize> {
        let text: String = payload.iter().collect();
        let bytes = text.as_bytes();
        check_fits(bytes.len(), buffer.len())?;
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<Vec<char>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::invalid_operation(format!("frame is not valid UTF-8: {e}")))?;
        Ok(text.chars().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let m = BytesMarshaller;
        let mut buf = [0u8; 16];
        let payload = Bytes::from_static(b"hello");
        let n = m.write(&payload, &mut buf).unwrap();
        assert_eq!(m.read(&buf[..n]).unwrap(), payload);
    }

    #[test]
    fn utf8_string_round_trip() {
        let m = Utf8StringMarshaller;
        let mut buf = [0u8; 16];
        let n = m.write(&"hi there".to_string(), &mut buf).unwrap();
        assert_eq!(m.read(&buf[..n]).unwrap(), "hi there");
    }

    #[test]
    fn utf8_int32_round_trip_matches_spec_encoding() {
        let m = Utf8Int32Marshaller;
        let mut buf = [0u8; 16];
        let n = m.write(&3, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"3");
        assert_eq!(m.read(&buf[..n]).unwrap(), 3);
    }

    #[test]
    fn char_memory_round_trip() {
        let m = CharMemoryMarshaller;
        let mut buf = [0u8; 16];
        let payload = vec!['a', 'b', 'c'];
        let n = m.write(&payload, &mut buf).unwrap();
        assert_eq!(m.read(&buf[..n]).unwrap(), payload);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let m = BytesMarshaller;
        let mut buf = [0u8; 2];
        assert!(m.write(&Bytes::from_static(b"too long"), &mut buf).is_err());
    }
}
