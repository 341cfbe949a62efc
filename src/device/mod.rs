//! The echo device: one shared message buffer behind an attach/detach
//! lifecycle.
//!
//! Every session reads and writes the same buffer, so the last writer wins
//! and all readers see its message. The buffer and its length sit behind a
//! single lock, making each read and write one atomic step.

pub mod buffer;
pub mod session;
pub mod transfer;

pub use buffer::{DeviceError, EchoBuffer, Written, DEFAULT_CAPACITY};
pub use session::Session;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace, warn};
use transfer::{Sink, Source};

/// Registration metadata for the device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Node name, e.g. `echo` for `/dev/echo`.
    pub name: String,
    /// Owning user id.
    pub owner: u32,
    /// Owning group id.
    pub group: u32,
    /// Permission bits.
    pub mode: u32,
}

impl Default for DeviceNode {
    fn default() -> Self {
        Self {
            name: "echo".to_string(),
            owner: 0,
            group: 0,
            mode: 0o600,
        }
    }
}

impl std::fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const BITS: [(u32, char); 9] = [
            (0o400, 'r'),
            (0o200, 'w'),
            (0o100, 'x'),
            (0o040, 'r'),
            (0o020, 'w'),
            (0o010, 'x'),
            (0o004, 'r'),
            (0o002, 'w'),
            (0o001, 'x'),
        ];

        let perms: String = BITS
            .iter()
            .map(|&(bit, c)| if self.mode & bit != 0 { c } else { '-' })
            .collect();
        write!(
            f,
            "c{perms} {}:{} /dev/{}",
            self.owner, self.group, self.name
        )
    }
}

/// Everything needed to attach a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub node: DeviceNode,
    /// Maximum message length in bytes.
    pub capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            node: DeviceNode::default(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Point-in-time device counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub length: usize,
    pub capacity: usize,
    pub open_sessions: usize,
    pub total_opens: u64,
    pub writes: u64,
    pub reads: u64,
}

/// The attached echo device.
#[derive(Debug)]
pub struct EchoDevice {
    node: DeviceNode,
    buffer: RwLock<EchoBuffer>,
    open_sessions: AtomicUsize,
    total_opens: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl EchoDevice {
    /// Allocate the buffer and register the node.
    ///
    /// Allocation failure is fatal: no buffer, no device.
    pub fn attach(config: DeviceConfig) -> Result<Arc<Self>, AttachError> {
        let buffer = EchoBuffer::with_capacity(config.capacity).map_err(|_| {
            AttachError::Allocation {
                capacity: config.capacity,
            }
        })?;

        info!(
            node = %config.node,
            capacity = config.capacity,
            "Echo device loaded"
        );

        Ok(Arc::new(Self {
            node: config.node,
            buffer: RwLock::new(buffer),
            open_sessions: AtomicUsize::new(0),
            total_opens: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }))
    }

    /// Release the device.
    ///
    /// Fails while any other handle (including open sessions) is alive; the
    /// error hands the device back so the caller can drain and retry.
    pub fn detach(self: Arc<Self>) -> Result<(), DetachError> {
        match Arc::try_unwrap(self) {
            Ok(device) => {
                info!(node = %device.node, "Echo device unloaded");
                Ok(())
            }
            Err(device) => {
                let references = Arc::strong_count(&device) - 1;
                warn!(
                    node = %device.node,
                    references,
                    "Detach refused, device still in use"
                );
                Err(DetachError { device, references })
            }
        }
    }

    /// Open a new session positioned at offset 0.
    pub fn open(self: &Arc<Self>) -> Session {
        let id = self.total_opens.fetch_add(1, Ordering::Relaxed);
        let open = self.open_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session = id, open, device = %self.node.name, "Session opened");
        Session::new(Arc::clone(self), id)
    }

    pub(crate) fn close(&self, id: u64) {
        let open = self.open_sessions.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(session = id, open, device = %self.node.name, "Session closed");
    }

    /// Write `src` into the shared buffer at `offset`.
    pub fn write<S: Source + ?Sized>(
        &self,
        offset: usize,
        src: &mut S,
    ) -> Result<Written, DeviceError> {
        let result = self.buffer_mut().write(offset, src);
        self.writes.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(written) => trace!(
                offset,
                consumed = written.consumed,
                length = written.length,
                "write"
            ),
            Err(DeviceError::InvalidOffset { .. }) => {
                debug!(offset, "Rejected random-access write")
            }
            Err(e) => warn!(offset, error = %e, "Write failed"),
        }
        result
    }

    /// Read up to `max_bytes` from `offset` into `dst`.
    pub fn read<K: Sink + ?Sized>(
        &self,
        offset: usize,
        max_bytes: usize,
        dst: &mut K,
    ) -> Result<usize, DeviceError> {
        let result = self.buffer().read(offset, max_bytes, dst);
        self.reads.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(n) => trace!(offset, max_bytes, returned = n, "read"),
            Err(e) => warn!(offset, error = %e, "Read failed"),
        }
        result
    }

    /// Registration metadata.
    pub fn node(&self) -> &DeviceNode {
        &self.node
    }

    pub fn stats(&self) -> DeviceStats {
        let buffer = self.buffer();
        DeviceStats {
            length: buffer.length(),
            capacity: buffer.capacity(),
            open_sessions: self.open_sessions.load(Ordering::Relaxed),
            total_opens: self.total_opens.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }

    // Every buffer mutation restores the invariants before returning, so a
    // poisoned lock still guards a consistent buffer.
    fn buffer(&self) -> RwLockReadGuard<'_, EchoBuffer> {
        self.buffer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer_mut(&self) -> RwLockWriteGuard<'_, EchoBuffer> {
        self.buffer.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Device attach errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    Allocation { capacity: usize },
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::Allocation { capacity } => {
                write!(f, "Failed to allocate echo buffer of {capacity} bytes")
            }
        }
    }
}

impl std::error::Error for AttachError {}

/// Detach refused because the device is still referenced.
#[derive(Debug)]
pub struct DetachError {
    /// The device, handed back so the caller can drain and retry.
    pub device: Arc<EchoDevice>,
    /// Other handles alive at the time of the attempt.
    pub references: usize,
}

impl std::fmt::Display for DetachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Device '{}' is busy: {} other references",
            self.device.node.name, self.references
        )
    }
}

impl std::error::Error for DetachError {}
