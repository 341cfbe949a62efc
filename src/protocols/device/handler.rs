//! Device protocol handler for the Tokio runtime.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::device::Session;
use crate::runtime::request::{process, ProcessResult};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Handle a device protocol connection.
///
/// The connection owns `session` for its whole lifetime; the session closes
/// when this returns.
pub async fn handle_connection<S>(
    mut stream: S,
    mut session: Session,
    max_request_size: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut input = BytesMut::with_capacity(BUFFER_SIZE);
    let mut output = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let n = stream.read_buf(&mut input).await?;
        if n == 0 {
            trace!(session = session.id(), "Connection closed by client");
            return Ok(());
        }

        let mut done = false;
        while !done {
            match process(&input, &mut output, &mut session, max_request_size) {
                ProcessResult::Response { consumed } => input.advance(consumed),
                ProcessResult::NeedData => break,
                ProcessResult::Close | ProcessResult::Quit => done = true,
            }
        }

        if !output.is_empty() {
            stream.write_all(&output).await?;
            output.clear();
        }

        if done {
            stream.flush().await?;
            return Ok(());
        }
    }
}
