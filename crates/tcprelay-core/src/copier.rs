//! Byte copier
//!
//! Moves bytes from one endpoint's read half to the other endpoint's write
//! half until the source is exhausted or an I/O error ends the transfer.
//! Each relay direction runs the copier in its own task and hands both halves
//! back to the session engine when it finishes, so only the engine ever
//! half-closes or closes a connection.

use crate::error::RelayError;
use crate::session::Endpoint;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

const BUFFER_SIZE: usize = 16 * 1024;

/// One of the two relay directions of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound read half to outbound write half.
    Upstream,
    /// Outbound read half to inbound write half.
    Downstream,
}

impl Direction {
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Upstream => "->",
            Direction::Downstream => "<-",
        }
    }

    /// Endpoint whose write half this direction feeds.
    pub fn destination(self) -> Endpoint {
        match self {
            Direction::Upstream => Endpoint::Outbound,
            Direction::Downstream => Endpoint::Inbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "inbound->outbound"),
            Direction::Downstream => write!(f, "outbound->inbound"),
        }
    }
}

/// How a relay direction ended when it did not fail unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The source reached end of stream.
    Eof { bytes: u64 },
    /// A peer or the local side tore the connection down mid-transfer.
    Closed { bytes: u64, kind: io::ErrorKind },
}

impl CopyOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            CopyOutcome::Eof { bytes } | CopyOutcome::Closed { bytes, .. } => *bytes,
        }
    }
}

/// Errors that come from normal connection teardown rather than a defect.
pub fn is_expected_closure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Copy `reader` into `writer` until end of stream.
///
/// Expected closures end the copy with [`CopyOutcome::Closed`]; any other I/O
/// error is returned as [`RelayError::Copy`]. Neither half is shut down here.
pub async fn copy<R, W>(
    direction: Direction,
    label: &str,
    reader: &mut R,
    writer: &mut W,
) -> Result<CopyOutcome, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return Ok(CopyOutcome::Eof { bytes }),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return classify(direction, label, bytes, e),
        };

        trace!("{} read {} bytes", label, n);

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            return classify(direction, label, bytes, e);
        }
        bytes += n as u64;
    }
}

fn classify(
    direction: Direction,
    label: &str,
    bytes: u64,
    err: io::Error,
) -> Result<CopyOutcome, RelayError> {
    if is_expected_closure(&err) {
        info!("{} {}", label, err);
        Ok(CopyOutcome::Closed {
            bytes,
            kind: err.kind(),
        })
    } else {
        debug!("{} unexpected failure: {}", label, err);
        Err(RelayError::Copy {
            direction,
            source: err,
        })
    }
}

/// What a finished relay direction hands back to the session engine.
pub struct DirectionReport<R, W> {
    pub direction: Direction,
    pub reader: R,
    pub writer: W,
    pub result: Result<CopyOutcome, RelayError>,
}

/// Run one relay direction on its own task.
///
/// The returned handle resolves exactly once, whether the copy finished,
/// failed, or the task panicked.
pub fn spawn_direction<R, W>(
    direction: Direction,
    label: String,
    mut reader: R,
    mut writer: W,
) -> JoinHandle<DirectionReport<R, W>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        info!("{} begin", label);
        let result = copy(direction, &label, &mut reader, &mut writer).await;
        info!("{} end", label);

        DirectionReport {
            direction,
            reader,
            writer,
            result,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Writer that rejects every write with the given error kind.
    struct FailingWriter(io::ErrorKind);

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(self.0, "rejected")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_until_eof() {
        let mut source: &[u8] = b"hello relay";
        let mut sink = Vec::new();

        let outcome = copy(Direction::Upstream, "[1] test", &mut source, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Eof { bytes: 11 });
        assert_eq!(sink, b"hello relay");
    }

    #[tokio::test]
    async fn test_copy_large_payload_in_order() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut source: &[u8] = &payload;
        let mut sink = Vec::new();

        let outcome = copy(Direction::Downstream, "[1] test", &mut source, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.bytes(), payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn test_broken_pipe_is_expected_closure() {
        let mut source: &[u8] = b"data";
        let mut sink = FailingWriter(io::ErrorKind::BrokenPipe);

        let outcome = copy(Direction::Upstream, "[1] test", &mut source, &mut sink)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CopyOutcome::Closed {
                bytes: 0,
                kind: io::ErrorKind::BrokenPipe
            }
        );
    }

    #[tokio::test]
    async fn test_other_error_is_escalated() {
        let mut source: &[u8] = b"data";
        let mut sink = FailingWriter(io::ErrorKind::PermissionDenied);

        let err = copy(Direction::Upstream, "[1] test", &mut source, &mut sink)
            .await
            .unwrap_err();

        match err {
            RelayError::Copy { direction, source } => {
                assert_eq!(direction, Direction::Upstream);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_expected_closure_classes() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(is_expected_closure(&io::Error::from(kind)), "{:?}", kind);
        }
        assert!(!is_expected_closure(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        assert!(!is_expected_closure(&io::Error::from(io::ErrorKind::Other)));
    }

    #[tokio::test]
    async fn test_spawned_direction_returns_halves() {
        let (mut client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);

        client.write_all(b"ping").await.unwrap();
        drop(client);

        let handle = spawn_direction(Direction::Upstream, "[7] a->b".to_string(), server_read, Vec::new());
        let report = handle.await.unwrap();

        assert_eq!(report.direction, Direction::Upstream);
        assert_eq!(report.writer, b"ping");
        assert_eq!(report.result.unwrap(), CopyOutcome::Eof { bytes: 4 });
    }

    #[test]
    fn test_direction_destination() {
        assert_eq!(Direction::Upstream.destination(), Endpoint::Outbound);
        assert_eq!(Direction::Downstream.destination(), Endpoint::Inbound);
        assert_eq!(Direction::Upstream.arrow(), "->");
        assert_eq!(Direction::Downstream.to_string(), "outbound->inbound");
    }
}
