//! Unidirectional byte copy between two connections
//!
//! Each established session runs two of these loops, one per direction. The
//! idle timeout is an inactivity timer re-armed on every read/write cycle,
//! not a total-session cap. A session-scoped cancellation token ties the two
//! directions together: whichever loop terminates first cancels the token,
//! so the paired loop wakes — even out of a stalled write — runs its own
//! accounting and drops its halves, closing both connections promptly.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Why a directional copy stopped.
///
/// Every variant charges the transferred byte count identically; they differ
/// only in log classification.
#[derive(Debug)]
pub enum PipeEnd {
    /// Natural end-of-stream on the source
    Eof,
    /// Idle deadline expired on a read or write
    Timeout,
    /// The paired direction terminated first
    PeerClosed,
    /// Transport error (short writes included)
    Io(io::Error),
}

async fn read_chunk<R>(
    src: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, src.read(buf))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))),
        None => src.read(buf).await,
    }
}

async fn write_some<W>(
    dst: &mut W,
    chunk: &[u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, dst.write(chunk))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))),
        None => dst.write(chunk).await,
    }
}

/// Copy bytes from `src` to `dst` until end-of-stream, an error, an idle
/// deadline, or cancellation by the paired direction.
///
/// Returns the number of bytes actually written to the destination and the
/// reason the loop ended. A chunk aborted mid-write still counts its written
/// prefix. On return the destination has been shut down and the session
/// token cancelled, whatever the cause.
pub async fn copy_direction<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_timeout: Option<Duration>,
    session: &CancellationToken,
) -> (u64, PipeEnd)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;

    let end = 'copy: loop {
        let n = tokio::select! {
            read = read_chunk(src, &mut buf, idle_timeout) => match read {
                Ok(0) => break PipeEnd::Eof,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break PipeEnd::Timeout,
                Err(e) => break PipeEnd::Io(e),
            },
            () = session.cancelled() => break PipeEnd::PeerClosed,
        };

        // Drain the chunk write by write, counting every byte the
        // destination took. A write can stall for as long as the peer stops
        // draining, so cancellation must be observable here too, not just
        // around the read.
        let mut offset = 0;
        while offset < n {
            let wrote = tokio::select! {
                write = write_some(dst, &buf[offset..n], idle_timeout) => match write {
                    Ok(0) => break 'copy PipeEnd::Io(io::ErrorKind::WriteZero.into()),
                    Ok(wrote) => wrote,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => break 'copy PipeEnd::Timeout,
                    Err(e) => break 'copy PipeEnd::Io(e),
                },
                () = session.cancelled() => break 'copy PipeEnd::PeerClosed,
            };
            written += wrote as u64;
            offset += wrote;
        }
    };

    // Shut down our destination and wake the paired direction so the whole
    // session tears down even though each loop only drives one direction.
    let _ = dst.shutdown().await;
    session.cancel();

    (written, end)
}
