//! Transfer layer between callers and the echo buffer.
//!
//! The device never reads or writes caller memory directly. A write pulls
//! bytes out of a [`Source`], a read pushes bytes into a [`Sink`]. Either side
//! may stop part-way through and report how much made it across.

use bytes::BytesMut;

/// A copy that stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Bytes successfully copied before the fault.
    pub transferred: usize,
}

/// Caller-provided data flowing into the device.
pub trait Source {
    /// Bytes the caller is offering.
    fn remaining(&self) -> usize;

    /// Fill `dst` completely, consuming the copied bytes from the source.
    fn copy_to(&mut self, dst: &mut [u8]) -> Result<(), Fault>;
}

/// Caller-provided destination for bytes leaving the device.
pub trait Sink {
    /// Accept all of `src`.
    fn copy_from(&mut self, src: &[u8]) -> Result<(), Fault>;
}

impl Source for &[u8] {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn copy_to(&mut self, dst: &mut [u8]) -> Result<(), Fault> {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];

        if n < dst.len() {
            return Err(Fault { transferred: n });
        }
        Ok(())
    }
}

impl Sink for Vec<u8> {
    fn copy_from(&mut self, src: &[u8]) -> Result<(), Fault> {
        self.extend_from_slice(src);
        Ok(())
    }
}

impl Sink for BytesMut {
    fn copy_from(&mut self, src: &[u8]) -> Result<(), Fault> {
        self.extend_from_slice(src);
        Ok(())
    }
}

/// Adapters that fail after a fixed number of bytes.
#[cfg(test)]
pub(crate) mod faulty {
    use super::{Fault, Sink, Source};

    /// A source whose backing memory becomes unreadable after `readable` bytes.
    pub struct FaultySource<'a> {
        pub data: &'a [u8],
        pub readable: usize,
    }

    impl Source for FaultySource<'_> {
        fn remaining(&self) -> usize {
            self.data.len()
        }

        fn copy_to(&mut self, dst: &mut [u8]) -> Result<(), Fault> {
            let n = dst.len().min(self.readable).min(self.data.len());
            dst[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            self.readable -= n;

            if n < dst.len() {
                return Err(Fault { transferred: n });
            }
            Ok(())
        }
    }

    /// A sink that only has room for `room` more bytes.
    pub struct FaultySink {
        pub received: Vec<u8>,
        pub room: usize,
    }

    impl Sink for FaultySink {
        fn copy_from(&mut self, src: &[u8]) -> Result<(), Fault> {
            let n = src.len().min(self.room);
            self.received.extend_from_slice(&src[..n]);
            self.room -= n;

            if n < src.len() {
                return Err(Fault { transferred: n });
            }
            Ok(())
        }
    }
}
