//! Device protocol parser.

/// Longest command line accepted before the connection is dropped.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write a payload at the session position (header consumed, data follows).
    Write {
        /// Length of the payload.
        length: usize,
        /// Bytes consumed by the header line (including \r\n).
        header_len: usize,
    },
    /// Read up to `max` bytes at the session position.
    Read { max: usize },
    /// Move the session position.
    Seek { offset: usize },
    /// Report device counters.
    Stat,
    /// Quit command.
    Quit,
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Numeric argument missing or malformed.
    InvalidArgument,
    /// Verb not recognised.
    UnknownCommand,
}

impl ParseError {
    /// Text sent back to the client.
    pub fn message(&self) -> &'static str {
        match self {
            ParseError::InvalidArgument => "invalid argument",
            ParseError::UnknownCommand => "unknown command",
        }
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed command with bytes consumed by its line.
    Complete(Command, usize),
    /// Need more data for the line.
    Incomplete,
    /// Malformed line; skip `usize` bytes and report the error.
    Invalid(ParseError, usize),
    /// No line ending within `MAX_LINE_LENGTH` bytes.
    LineTooLong,
}

/// Parse one command line from the input buffer.
///
/// For `Write` the caller must wait until the payload and its trailing
/// `\r\n` have arrived before executing it.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_LINE_LENGTH => return ParseResult::LineTooLong,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    let consumed = line_end + 2; // include \r\n

    let (verb, arg) = match line.iter().position(|&b| b == b' ') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    };

    let command = if verb.eq_ignore_ascii_case(b"WRITE") {
        parse_number(arg).map(|length| Command::Write {
            length,
            header_len: consumed,
        })
    } else if verb.eq_ignore_ascii_case(b"READ") {
        parse_number(arg).map(|max| Command::Read { max })
    } else if verb.eq_ignore_ascii_case(b"SEEK") {
        parse_number(arg).map(|offset| Command::Seek { offset })
    } else if verb.eq_ignore_ascii_case(b"STAT") && arg.is_none() {
        Ok(Command::Stat)
    } else if verb.eq_ignore_ascii_case(b"QUIT") && arg.is_none() {
        Ok(Command::Quit)
    } else {
        Err(ParseError::UnknownCommand)
    };

    match command {
        Ok(command) => ParseResult::Complete(command, consumed),
        Err(e) => ParseResult::Invalid(e, consumed),
    }
}

fn parse_number(arg: Option<&[u8]>) -> Result<usize, ParseError> {
    let arg = arg.ok_or(ParseError::InvalidArgument)?;
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(ParseError::InvalidArgument)
}

/// Format a write acknowledgement.
pub fn response_wrote(consumed: usize) -> Vec<u8> {
    format!("WROTE {consumed}\r\n").into_bytes()
}

/// Format the header preceding read data.
pub fn response_data_header(length: usize) -> Vec<u8> {
    format!("DATA {length}\r\n").into_bytes()
}

/// Format a seek acknowledgement.
pub fn response_offset(offset: usize) -> Vec<u8> {
    format!("OFFSET {offset}\r\n").into_bytes()
}

/// Format a single statistic line.
pub fn response_stat(name: &str, value: &str) -> Vec<u8> {
    format!("STAT {name} {value}\r\n").into_bytes()
}

/// Terminates a STAT listing.
pub fn response_end() -> &'static [u8] {
    b"END\r\n"
}

/// Format an error response.
pub fn response_error(msg: &str) -> Vec<u8> {
    format!("ERROR {msg}\r\n").into_bytes()
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write() {
        match parse(b"WRITE 4\r\nping\r\n") {
            ParseResult::Complete(Command::Write { length, header_len }, consumed) => {
                assert_eq!(length, 4);
                assert_eq!(header_len, 9);
                assert_eq!(consumed, 9);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_read_seek() {
        match parse(b"read 255\r\n") {
            ParseResult::Complete(Command::Read { max: 255 }, 10) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"SEEK 0\r\n") {
            ParseResult::Complete(Command::Seek { offset: 0 }, 8) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_stat_quit() {
        match parse(b"STAT\r\n") {
            ParseResult::Complete(Command::Stat, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"quit\r\n") {
            ParseResult::Complete(Command::Quit, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        match parse(b"WRITE 10") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_argument() {
        match parse(b"WRITE abc\r\n") {
            ParseResult::Invalid(ParseError::InvalidArgument, 11) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"READ\r\n") {
            ParseResult::Invalid(ParseError::InvalidArgument, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"SEEK -1\r\n") {
            ParseResult::Invalid(ParseError::InvalidArgument, 9) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command() {
        match parse(b"FOO 1\r\n") {
            ParseResult::Invalid(ParseError::UnknownCommand, 7) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_line_too_long() {
        let input = vec![b'A'; MAX_LINE_LENGTH + 1];
        match parse(&input) {
            ParseResult::LineTooLong => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_responses() {
        assert_eq!(response_wrote(4), b"WROTE 4\r\n");
        assert_eq!(response_data_header(5), b"DATA 5\r\n");
        assert_eq!(response_offset(0), b"OFFSET 0\r\n");
        assert_eq!(response_stat("length", "4"), b"STAT length 4\r\n");
        assert_eq!(response_error("invalid offset"), b"ERROR invalid offset\r\n");
    }
}
