//! Open handles on the echo device.
//!
//! A session carries nothing but a file position. The position advances by
//! the bytes each read or write transfers, so consecutive writes on one
//! session append and a fresh session starts a new message.

use super::transfer::{Sink, Source};
use super::{DeviceError, EchoDevice};
use std::sync::Arc;

/// An open handle on the device. Dropping it closes the session.
#[derive(Debug)]
pub struct Session {
    device: Arc<EchoDevice>,
    id: u64,
    offset: usize,
}

impl Session {
    pub(super) fn new(device: Arc<EchoDevice>, id: u64) -> Self {
        Self {
            device,
            id,
            offset: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current file position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn device(&self) -> &Arc<EchoDevice> {
        &self.device
    }

    /// Move the file position to an absolute offset.
    pub fn seek(&mut self, offset: usize) -> usize {
        self.offset = offset;
        self.offset
    }

    /// Write at the current position and advance past the consumed bytes.
    ///
    /// On a transfer fault the position still advances by what was copied.
    pub fn write<S: Source + ?Sized>(&mut self, src: &mut S) -> Result<usize, DeviceError> {
        match self.device.write(self.offset, src) {
            Ok(written) => {
                self.offset += written.consumed;
                Ok(written.consumed)
            }
            Err(DeviceError::TransferFault { transferred }) => {
                self.offset += transferred;
                Err(DeviceError::TransferFault { transferred })
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `max_bytes` at the current position and advance past them.
    pub fn read<K: Sink + ?Sized>(
        &mut self,
        max_bytes: usize,
        dst: &mut K,
    ) -> Result<usize, DeviceError> {
        match self.device.read(self.offset, max_bytes, dst) {
            Ok(n) => {
                self.offset += n;
                Ok(n)
            }
            Err(DeviceError::TransferFault { transferred }) => {
                self.offset += transferred;
                Err(DeviceError::TransferFault { transferred })
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.device.close(self.id);
    }
}
