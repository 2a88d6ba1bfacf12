//! Pipe links between adjacent stages.
//!
//! A link owns a relay task moving bytes from the upstream stage's stdout to
//! the downstream stage's stdin. The relay ends when the upstream side reaches
//! EOF, the downstream side goes away, or the link's stop token fires on kill
//! or teardown. Dropping the downstream stdin at that point is the EOF signal
//! for the downstream stage.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Relay buffer size, the default Linux pipe capacity.
const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Connection between stage `index` and stage `index + 1`.
#[derive(Debug)]
pub(crate) struct PipeLink {
    index: usize,
    relay: Option<JoinHandle<io::Result<u64>>>,
}

impl PipeLink {
    /// Start relaying from `upstream` into `downstream`.
    pub(crate) fn connect<R, W>(
        index: usize,
        upstream: R,
        downstream: W,
        cancel: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let relay = tokio::spawn(relay(upstream, downstream, cancel));
        Self {
            index,
            relay: Some(relay),
        }
    }

    /// Index of the upstream stage.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Whether both ends have been released.
    pub(crate) fn is_closed(&self) -> bool {
        self.relay.is_none()
    }

    /// Close the write side once the upstream stage has exited.
    ///
    /// Waits for the relay to flush what the upstream stage produced, then
    /// releases the downstream stdin. Returns the number of bytes relayed, or
    /// `None` if the link was already closed.
    pub(crate) async fn close_write(&mut self) -> Option<io::Result<u64>> {
        let relay = self.relay.take()?;
        Some(match relay.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(io::Error::from(io::ErrorKind::Interrupted)),
            Err(err) => Err(io::Error::other(err)),
        })
    }

    /// Close the read side, abandoning anything not yet relayed.
    pub(crate) fn close_read(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

impl Drop for PipeLink {
    fn drop(&mut self) {
        self.close_read();
    }
}

async fn relay<R, W>(mut upstream: R, mut downstream: W, cancel: CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            read = upstream.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        let written = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            written = downstream.write_all(&buf[..n]) => written,
        };
        match written {
            Ok(()) => total += n as u64,
            // Downstream stopped reading; dropping `upstream` passes that on.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => break,
            Err(err) => return Err(err),
        }
    }

    Ok(total)
}
