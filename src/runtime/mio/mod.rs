//! mio-based event loop: readiness-driven workers with a shared shutdown.

mod event_loop;
pub use event_loop::{run, Shutdown};
