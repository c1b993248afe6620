//! Session engine
//!
//! Owns one inbound/outbound connection pair for the lifetime of a session:
//! dials the remote address, runs the two relay directions concurrently,
//! half-closes the opposite write half as each direction finishes, and closes
//! both connections once both directions are done.
//!
//! ```text
//! Connecting -> Relaying -> Draining -> Closed
//! ```

use crate::copier::{is_expected_closure, spawn_direction, Direction, DirectionReport};
use crate::error::RelayError;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

/// A connection the engine can split into halves owned by separate tasks.
pub trait SplitStream: Sized + Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn split_halves(self) -> (Self::Reader, Self::Writer);

    /// Rejoin the halves of one connection so it can be dropped as a whole.
    fn reunite(reader: Self::Reader, writer: Self::Writer) -> Result<Self, String>;
}

impl SplitStream for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn split_halves(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.into_split()
    }

    fn reunite(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Result<Self, String> {
        reader.reunite(writer).map_err(|e| e.to_string())
    }
}

/// Process-unique session number, assigned at accept time starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two connections a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Accepted from the listener.
    Inbound,
    /// Dialed to the remote address.
    Outbound,
}

impl Endpoint {
    fn side(self) -> &'static str {
        match self {
            Endpoint::Inbound => "local",
            Endpoint::Outbound => "remote",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inbound => write!(f, "inbound"),
            Endpoint::Outbound => write!(f, "outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    /// One direction has completed, the other is still running.
    Draining,
    Closed,
}

/// Bytes relayed by a session that ran to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

impl SessionSummary {
    fn record(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upstream => self.bytes_upstream = bytes,
            Direction::Downstream => self.bytes_downstream = bytes,
        }
    }
}

/// One accepted connection waiting to be relayed.
pub struct Session {
    id: SessionId,
    inbound: TcpStream,
    inbound_peer: SocketAddr,
    remote_addr: SocketAddr,
}

impl Session {
    pub fn new(
        id: SessionId,
        inbound: TcpStream,
        inbound_peer: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            inbound,
            inbound_peer,
            remote_addr,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Relay the session until both directions complete.
    ///
    /// Both connections are closed before this returns, on success and on
    /// every error path.
    pub async fn run(self) -> Result<SessionSummary, RelayError> {
        let Session {
            id,
            inbound,
            inbound_peer,
            remote_addr,
        } = self;

        info!("[{}] Accepted connection from {}...", id, inbound_peer);

        let outbound = match TcpStream::connect(remote_addr).await {
            Ok(stream) => stream,
            Err(source) => {
                info!("[{}] Closing accepted connection from {}", id, inbound_peer);
                drop(inbound);
                return Err(RelayError::Dial {
                    address: remote_addr,
                    source,
                });
            }
        };

        info!("[{}] Connected to {}", id, remote_addr);

        for (endpoint, stream) in [(Endpoint::Inbound, &inbound), (Endpoint::Outbound, &outbound)] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("[{}] Failed to set TCP_NODELAY on {}: {}", id, endpoint, e);
            }
        }

        relay_streams(id, inbound, inbound_peer, outbound, remote_addr).await
    }
}

/// Relay an already connected pair until both directions complete.
///
/// Half-closes each endpoint's write half as the direction feeding it ends,
/// then closes both endpoints. The first unexpected failure is returned once
/// both directions are done.
pub async fn relay_streams<I, O>(
    id: SessionId,
    inbound: I,
    inbound_peer: SocketAddr,
    outbound: O,
    remote_addr: SocketAddr,
) -> Result<SessionSummary, RelayError>
where
    I: SplitStream,
    O: SplitStream,
{
    let engine = Engine {
        id,
        inbound_peer,
        remote_addr,
        state: SessionState::Connecting,
        summary: SessionSummary::default(),
        failure: None,
    };
    engine.relay(inbound, outbound).await
}

/// Aborts a relay direction if the engine unwinds before observing it.
struct DirectionTask<T>(JoinHandle<T>);

impl<T> Drop for DirectionTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Engine {
    id: SessionId,
    inbound_peer: SocketAddr,
    remote_addr: SocketAddr,
    state: SessionState,
    summary: SessionSummary,
    failure: Option<RelayError>,
}

impl Engine {
    async fn relay<I, O>(mut self, inbound: I, outbound: O) -> Result<SessionSummary, RelayError>
    where
        I: SplitStream,
        O: SplitStream,
    {
        let (inbound_read, inbound_write) = inbound.split_halves();
        let (outbound_read, outbound_write) = outbound.split_halves();

        let mut upstream = DirectionTask(spawn_direction(
            Direction::Upstream,
            self.label(Direction::Upstream),
            inbound_read,
            outbound_write,
        ));
        let mut downstream = DirectionTask(spawn_direction(
            Direction::Downstream,
            self.label(Direction::Downstream),
            outbound_read,
            inbound_write,
        ));
        self.transition(SessionState::Relaying);

        // Outer Option: direction finished. Inner Option: its halves survived.
        let mut upstream_done: Option<Option<(I::Reader, O::Writer)>> = None;
        let mut downstream_done: Option<Option<(O::Reader, I::Writer)>> = None;

        while upstream_done.is_none() || downstream_done.is_none() {
            tokio::select! {
                joined = &mut upstream.0, if upstream_done.is_none() => {
                    upstream_done = Some(self.complete(Direction::Upstream, joined).await);
                }
                joined = &mut downstream.0, if downstream_done.is_none() => {
                    downstream_done = Some(self.complete(Direction::Downstream, joined).await);
                }
            }
        }

        // Upstream held inbound-read/outbound-write, downstream the reverse.
        let (inbound_read, outbound_write) = unzip(upstream_done.flatten());
        let (outbound_read, inbound_write) = unzip(downstream_done.flatten());

        self.close::<I>(Endpoint::Inbound, inbound_read, inbound_write);
        self.close::<O>(Endpoint::Outbound, outbound_read, outbound_write);
        self.transition(SessionState::Closed);

        match self.failure.take() {
            Some(e) => Err(e),
            None => {
                debug!(
                    "[{}] Session finished ({} bytes ->, {} bytes <-)",
                    self.id, self.summary.bytes_upstream, self.summary.bytes_downstream
                );
                Ok(self.summary)
            }
        }
    }

    /// Handle one direction's completion and half-close the endpoint it fed.
    async fn complete<R, W>(
        &mut self,
        direction: Direction,
        joined: Result<DirectionReport<R, W>, JoinError>,
    ) -> Option<(R, W)>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state == SessionState::Relaying {
            self.transition(SessionState::Draining);
        }

        let DirectionReport {
            reader,
            mut writer,
            result,
            ..
        } = match joined {
            Ok(report) => report,
            Err(e) => {
                // The task dropped its halves while unwinding.
                self.fail(RelayError::DirectionAborted {
                    direction,
                    reason: e.to_string(),
                });
                return None;
            }
        };

        match result {
            Ok(outcome) => self.summary.record(direction, outcome.bytes()),
            Err(e) => self.fail(e),
        }

        let endpoint = direction.destination();
        info!("[{}] closing write to {}", self.id, endpoint.side());
        if let Err(e) = writer.shutdown().await {
            if is_expected_closure(&e) {
                debug!("[{}] {} write half already closed: {}", self.id, endpoint, e);
            } else {
                self.fail(RelayError::HalfClose {
                    endpoint,
                    source: e,
                });
            }
        }

        Some((reader, writer))
    }

    fn close<S: SplitStream>(
        &mut self,
        endpoint: Endpoint,
        reader: Option<S::Reader>,
        writer: Option<S::Writer>,
    ) {
        match endpoint {
            Endpoint::Inbound => info!(
                "[{}] Closing accepted connection from {}",
                self.id, self.inbound_peer
            ),
            Endpoint::Outbound => info!(
                "[{}] Closing dialed connection to {}",
                self.id, self.remote_addr
            ),
        }

        if let (Some(reader), Some(writer)) = (reader, writer) {
            match S::reunite(reader, writer) {
                Ok(stream) => drop(stream),
                Err(reason) => self.fail(RelayError::Close { endpoint, reason }),
            }
        }
    }

    fn fail(&mut self, err: RelayError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        } else {
            error!("[{}] Additional failure on {}: {}", self.id, err.origin(), err);
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn label(&self, direction: Direction) -> String {
        format!(
            "[{}] {}{}{}",
            self.id,
            self.inbound_peer,
            direction.arrow(),
            self.remote_addr
        )
    }
}

fn unzip<R, W>(halves: Option<(R, W)>) -> (Option<R>, Option<W>) {
    match halves {
        Some((reader, writer)) => (Some(reader), Some(writer)),
        None => (None, None),
    }
}
