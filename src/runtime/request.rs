//! Request dispatch shared by both runtimes.
//!
//! Provides synchronous request processing that parses one command from raw
//! bytes, executes it against the connection's session, and appends the
//! response to an output buffer (no async runtime required).

use crate::device::{DeviceError, Session};
use crate::protocols::device::parser::{self, Command, ParseResult};
use bytes::BytesMut;
use tracing::{debug, trace};

/// Result of processing a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete parsing.
    NeedData,
    /// Command executed, response appended to the output buffer.
    /// Returns bytes consumed from input.
    Response { consumed: usize },
    /// Error response appended; flush it, then close the connection.
    Close,
    /// Client sent quit command.
    Quit,
}

/// Process the first command in `input` against `session`.
///
/// Callers loop until `NeedData` to drain pipelined requests.
pub fn process(
    input: &[u8],
    output: &mut BytesMut,
    session: &mut Session,
    max_request_size: usize,
) -> ProcessResult {
    let (command, consumed) = match parser::parse(input) {
        ParseResult::Complete(command, consumed) => (command, consumed),
        ParseResult::Incomplete => return ProcessResult::NeedData,
        ParseResult::Invalid(e, consumed) => {
            debug!(session = session.id(), error = ?e, "Parse error");
            output.extend_from_slice(&parser::response_error(e.message()));
            return ProcessResult::Response { consumed };
        }
        ParseResult::LineTooLong => {
            output.extend_from_slice(&parser::response_error("line too long"));
            return ProcessResult::Close;
        }
    };

    trace!(session = session.id(), ?command, "Processing command");

    match command {
        Command::Write { length, header_len } => {
            if length > max_request_size {
                debug!(length, max_request_size, "Write payload too large");
                output.extend_from_slice(&parser::response_error("request too large"));
                return ProcessResult::Close;
            }

            let data_end = header_len + length;
            if input.len() < data_end + 2 {
                return ProcessResult::NeedData;
            }
            if &input[data_end..data_end + 2] != b"\r\n" {
                output.extend_from_slice(&parser::response_error("bad data chunk"));
                return ProcessResult::Close;
            }

            let mut data = &input[header_len..data_end];
            match session.write(&mut data) {
                Ok(consumed) => output.extend_from_slice(&parser::response_wrote(consumed)),
                Err(e) => output.extend_from_slice(&parser::response_error(error_message(&e))),
            }

            ProcessResult::Response {
                consumed: data_end + 2,
            }
        }
        Command::Read { max } => {
            let mut data = Vec::new();
            match session.read(max, &mut data) {
                Ok(n) => {
                    output.extend_from_slice(&parser::response_data_header(n));
                    output.extend_from_slice(&data);
                    output.extend_from_slice(b"\r\n");
                }
                Err(e) => output.extend_from_slice(&parser::response_error(error_message(&e))),
            }
            ProcessResult::Response { consumed }
        }
        Command::Seek { offset } => {
            let offset = session.seek(offset);
            output.extend_from_slice(&parser::response_offset(offset));
            ProcessResult::Response { consumed }
        }
        Command::Stat => {
            write_stats(output, session);
            ProcessResult::Response { consumed }
        }
        Command::Quit => ProcessResult::Quit,
    }
}

fn write_stats(output: &mut BytesMut, session: &Session) {
    let device = session.device();
    let stats = device.stats();
    let node = device.node();

    let lines = [
        ("name", node.name.clone()),
        ("mode", format!("{:o}", node.mode)),
        ("capacity", stats.capacity.to_string()),
        ("length", stats.length.to_string()),
        ("offset", session.offset().to_string()),
        ("curr_sessions", stats.open_sessions.to_string()),
        ("total_sessions", stats.total_opens.to_string()),
        ("cmd_write", stats.writes.to_string()),
        ("cmd_read", stats.reads.to_string()),
    ];

    for (name, value) in &lines {
        output.extend_from_slice(&parser::response_stat(name, value));
    }
    output.extend_from_slice(parser::response_end());
}

fn error_message(e: &DeviceError) -> &'static str {
    match e {
        DeviceError::InvalidOffset { .. } => "invalid offset",
        DeviceError::TransferFault { .. } => "transfer fault",
    }
}
