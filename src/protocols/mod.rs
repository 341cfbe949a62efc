//! Protocol implementations.
//!
//! - `device`: text protocol exposing the echo device's read/write/seek
//!   operations, one session per connection.

pub mod device;
