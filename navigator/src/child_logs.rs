//! Plumbing from backend stdout/stderr into our own log stream.
//!
//! Each pipe gets a reader task that emits one tracing event per line,
//! tagged with the owning tenant and the stream name. The task ends when
//! the child closes the pipe.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

pub fn spawn_forwarder(
    source: String,
    stream: &'static str,
    reader: impl AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    "stderr" => warn!(source = %source, stream, "{line}"),
                    _ => info!(source = %source, stream, "{line}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(source = %source, stream, "error reading child output: {e}");
                    break;
                }
            }
        }
    });
}
