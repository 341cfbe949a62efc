//! The echo buffer state machine.
//!
//! A single message of at most `capacity` bytes followed by a terminator.
//! Writes either start a new message (offset 0) or continue the current one
//! (offset == length); random access is rejected. Reads may start anywhere
//! and see the message plus its trailing zero byte.

use super::transfer::{Sink, Source};
use std::collections::TryReserveError;

/// Message capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 255;

/// Byte stored immediately after the last valid message byte.
pub const TERMINATOR: u8 = 0;

/// How many bytes a write may take given what is left in the buffer.
pub fn bytes_to_consume(requested: usize, remaining_capacity: usize) -> usize {
    requested.min(remaining_capacity)
}

/// How many bytes are readable from `requested_offset`, terminator included.
pub fn bytes_available(requested_offset: usize, length: usize) -> usize {
    (length + 1).saturating_sub(requested_offset)
}

/// Errors returned by buffer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Write offset was neither 0 nor the current message length.
    InvalidOffset { offset: usize, length: usize },
    /// The caller's side of the copy failed after `transferred` bytes.
    TransferFault { transferred: usize },
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::InvalidOffset { offset, length } => write!(
                f,
                "invalid write offset {offset}: must be 0 or the message length {length}"
            ),
            DeviceError::TransferFault { transferred } => {
                write!(f, "transfer fault after {transferred} bytes")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    /// Bytes taken from the source.
    pub consumed: usize,
    /// Message length after the write.
    pub length: usize,
}

/// Fixed-capacity message storage.
pub struct EchoBuffer {
    /// `capacity + 1` bytes; the last slot is reserved for the terminator.
    content: Box<[u8]>,
    /// Valid message bytes, not counting the terminator.
    length: usize,
}

impl EchoBuffer {
    /// Allocate a zeroed buffer able to hold `capacity` message bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let slots = capacity.saturating_add(1);
        let mut content = Vec::new();
        content.try_reserve_exact(slots)?;
        content.resize(slots, TERMINATOR);

        Ok(Self {
            content: content.into_boxed_slice(),
            length: 0,
        })
    }

    /// Maximum message length.
    pub fn capacity(&self) -> usize {
        self.content.len() - 1
    }

    /// Current message length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The stored message, without its terminator.
    #[cfg(test)]
    pub fn message(&self) -> &[u8] {
        &self.content[..self.length]
    }

    /// Write `src` at `offset`.
    ///
    /// Offset 0 discards the current message first. Input beyond the
    /// remaining capacity is left in `src`. On a transfer fault the message
    /// keeps whatever arrived before the fault, still terminated.
    pub fn write<S: Source + ?Sized>(
        &mut self,
        offset: usize,
        src: &mut S,
    ) -> Result<Written, DeviceError> {
        if offset != 0 && offset != self.length {
            return Err(DeviceError::InvalidOffset {
                offset,
                length: self.length,
            });
        }

        if offset == 0 {
            self.length = 0;
        }

        let amount = bytes_to_consume(src.remaining(), self.capacity() - self.length);
        let copied = src.copy_to(&mut self.content[offset..offset + amount]);
        let transferred = match copied {
            Ok(()) => amount,
            Err(fault) => fault.transferred.min(amount),
        };

        self.length = offset + transferred;
        self.content[self.length] = TERMINATOR;

        match copied {
            Ok(()) => Ok(Written {
                consumed: amount,
                length: self.length,
            }),
            Err(_) => Err(DeviceError::TransferFault { transferred }),
        }
    }

    /// Copy up to `max_bytes` starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied; 0 means end of message.
    pub fn read<K: Sink + ?Sized>(
        &self,
        offset: usize,
        max_bytes: usize,
        dst: &mut K,
    ) -> Result<usize, DeviceError> {
        let amount = max_bytes.min(bytes_available(offset, self.length));
        if amount == 0 {
            return Ok(0);
        }

        dst.copy_from(&self.content[offset..offset + amount])
            .map_err(|fault| DeviceError::TransferFault {
                transferred: fault.transferred,
            })?;

        Ok(amount)
    }
}

impl std::fmt::Debug for EchoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoBuffer")
            .field("capacity", &self.capacity())
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transfer::faulty::{FaultySink, FaultySource};

    fn buffer() -> EchoBuffer {
        EchoBuffer::with_capacity(DEFAULT_CAPACITY).unwrap()
    }

    fn read_all(buf: &EchoBuffer, offset: usize, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        buf.read(offset, max, &mut out).unwrap();
        out
    }

    #[test]
    fn test_capacity_helpers() {
        assert_eq!(bytes_to_consume(10, 255), 10);
        assert_eq!(bytes_to_consume(300, 255), 255);
        assert_eq!(bytes_to_consume(5, 0), 0);

        assert_eq!(bytes_available(0, 2), 3);
        assert_eq!(bytes_available(2, 2), 1);
        assert_eq!(bytes_available(3, 2), 0);
        assert_eq!(bytes_available(100, 2), 0);
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = buffer();
        assert_eq!(buf.capacity(), 255);
        assert_eq!(buf.length(), 0);
        assert_eq!(read_all(&buf, 0, 10), vec![0]);
    }

    #[test]
    fn test_truncates_at_capacity() {
        let mut buf = buffer();
        let data = vec![b'x'; 300];

        let written = buf.write(0, &mut data.as_slice()).unwrap();
        assert_eq!(written.consumed, 255);
        assert_eq!(written.length, 255);
        assert_eq!(buf.message(), &data[..255]);

        let out = read_all(&buf, 0, 1000);
        assert_eq!(out.len(), 256);
        assert_eq!(out[255], TERMINATOR);
    }

    #[test]
    fn test_append() {
        let mut buf = buffer();
        buf.write(0, &mut &b"AB"[..]).unwrap();
        let written = buf.write(2, &mut &b"CD"[..]).unwrap();

        assert_eq!(written, Written { consumed: 2, length: 4 });
        assert_eq!(buf.message(), b"ABCD");
    }

    #[test]
    fn test_append_truncates_at_capacity() {
        let mut buf = EchoBuffer::with_capacity(6).unwrap();
        buf.write(0, &mut &b"ABCD"[..]).unwrap();

        let written = buf.write(4, &mut &b"EFGH"[..]).unwrap();
        assert_eq!(written, Written { consumed: 2, length: 6 });
        assert_eq!(buf.message(), b"ABCDEF");

        // Full: further appends take nothing.
        let written = buf.write(6, &mut &b"IJ"[..]).unwrap();
        assert_eq!(written.consumed, 0);
        assert_eq!(read_all(&buf, 0, 100), b"ABCDEF\0");
    }

    #[test]
    fn test_rejects_random_access() {
        let mut buf = buffer();
        buf.write(0, &mut &b"AB"[..]).unwrap();

        let err = buf.write(5, &mut &b"XY"[..]).unwrap_err();
        assert_eq!(err, DeviceError::InvalidOffset { offset: 5, length: 2 });
        assert_eq!(buf.message(), b"AB");
        assert_eq!(buf.length(), 2);
    }

    #[test]
    fn test_offset_zero_resets() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HELLO"[..]).unwrap();
        buf.write(0, &mut &b"HI"[..]).unwrap();

        assert_eq!(buf.length(), 2);
        assert_eq!(buf.message(), b"HI");
    }

    #[test]
    fn test_read_includes_terminator() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HI"[..]).unwrap();

        assert_eq!(read_all(&buf, 0, 10), vec![b'H', b'I', 0]);
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HI"[..]).unwrap();

        assert!(read_all(&buf, 3, 10).is_empty());
        assert_eq!(read_all(&buf, 2, 10), vec![0]);
    }

    #[test]
    fn test_partial_reads() {
        let mut buf = buffer();
        buf.write(0, &mut &b"ping"[..]).unwrap();

        assert_eq!(read_all(&buf, 1, 2), b"in");
        assert_eq!(read_all(&buf, 3, 10), b"g\0");
    }

    #[test]
    fn test_read_is_idempotent() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HI"[..]).unwrap();

        let first = read_all(&buf, 0, 1);
        let second = read_all(&buf, 0, 1);
        assert_eq!(first, b"H");
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_fault_keeps_prefix() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HELLO WORLD"[..]).unwrap();

        let mut src = FaultySource {
            data: b"bye now",
            readable: 3,
        };
        let err = buf.write(0, &mut src).unwrap_err();

        assert_eq!(err, DeviceError::TransferFault { transferred: 3 });
        assert_eq!(buf.length(), 3);
        assert_eq!(read_all(&buf, 0, 100), b"bye\0");
    }

    #[test]
    fn test_append_fault_keeps_prefix() {
        let mut buf = buffer();
        buf.write(0, &mut &b"AB"[..]).unwrap();

        let mut src = FaultySource {
            data: b"CDEF",
            readable: 1,
        };
        let err = buf.write(2, &mut src).unwrap_err();

        assert_eq!(err, DeviceError::TransferFault { transferred: 1 });
        assert_eq!(buf.message(), b"ABC");
        assert_eq!(read_all(&buf, 0, 100), b"ABC\0");
    }

    #[test]
    fn test_read_fault() {
        let mut buf = buffer();
        buf.write(0, &mut &b"HELLO"[..]).unwrap();

        let mut sink = FaultySink {
            received: Vec::new(),
            room: 2,
        };
        let err = buf.read(0, 10, &mut sink).unwrap_err();

        assert_eq!(err, DeviceError::TransferFault { transferred: 2 });
        assert_eq!(sink.received, b"HE");
        assert_eq!(buf.message(), b"HELLO");
    }

    #[test]
    fn test_zero_capacity() {
        let mut buf = EchoBuffer::with_capacity(0).unwrap();
        let written = buf.write(0, &mut &b"abc"[..]).unwrap();

        assert_eq!(written.consumed, 0);
        assert_eq!(read_all(&buf, 0, 10), vec![0]);
    }
}
