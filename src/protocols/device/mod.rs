//! Device protocol implementation.
//!
//! A line-based protocol that maps each TCP connection onto one open
//! session of the echo device, mirroring file I/O on `/dev/echo`:
//! - Client writes at the session position and gets back how much was taken.
//! - Client reads at the session position and gets back the bytes, the
//!   message terminator included.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  WRITE <length>\r\n<data of exactly length bytes>\r\n
//! Response: WROTE <consumed>\r\n
//!
//! Request:  READ <max>\r\n
//! Response: DATA <length>\r\n<data of exactly length bytes>\r\n
//!
//! Request:  SEEK <offset>\r\n
//! Response: OFFSET <offset>\r\n
//!
//! Request:  STAT\r\n
//! Response: STAT <name> <value>\r\n ... END\r\n
//!
//! Example:
//! Request:  WRITE 4\r\nping\r\n
//! Response: WROTE 4\r\n
//! Request:  SEEK 0\r\n
//! Response: OFFSET 0\r\n
//! Request:  READ 255\r\n
//! Response: DATA 5\r\nping\0\r\n
//! ```
//!
//! Errors are reported as `ERROR <message>\r\n`. Writing anywhere other
//! than offset 0 or the end of the current message yields
//! `ERROR invalid offset`.
//!
//! Special commands (line-based):
//! - `QUIT\r\n` - Close connection gracefully

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
