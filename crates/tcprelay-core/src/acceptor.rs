//! Acceptor loop
//!
//! Binds the local listener and turns every accepted connection into a
//! supervised session on its own task. The loop never waits on a session.
//! Session ids come from a counter owned by the loop alone.

use crate::config::RelayConfig;
use crate::session::{Session, SessionId};
use crate::supervisor::supervise;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to accept connection on {address}: {source}")]
    AcceptError {
        address: SocketAddr,
        source: io::Error,
    },
}

/// Session id generator: 1, 2, 3, ... never reused.
#[derive(Debug, Default)]
pub struct SessionCounter {
    last: u64,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> SessionId {
        self.last += 1;
        SessionId::new(self.last)
    }
}

pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    sessions: SessionCounter,
}

impl RelayServer {
    /// Bind the listener described by `config`.
    ///
    /// A dual-stack wildcard that cannot be bound (no IPv6 on the host) falls
    /// back to the IPv4 wildcard on the same port.
    pub async fn bind(config: &RelayConfig) -> Result<Self, AcceptorError> {
        let std_listener = match bind_listener(config.local_addr, config.dual_stack) {
            Ok(listener) => listener,
            Err(e)
                if config.dual_stack
                    && !matches!(
                        e.kind(),
                        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                    ) =>
            {
                let fallback =
                    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.local_addr.port());
                debug!(
                    "Dual-stack bind on {} failed ({}), falling back to {}",
                    config.local_addr, e, fallback
                );
                bind_listener(fallback, false).map_err(|e| bind_error(fallback, e))?
            }
            Err(e) => return Err(bind_error(config.local_addr, e)),
        };

        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            remote_addr: config.remote_addr,
            sessions: SessionCounter::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Accept the next inbound connection and assign it the next session id.
    pub async fn accept(&mut self) -> Result<Session, AcceptorError> {
        let (stream, peer) =
            self.listener
                .accept()
                .await
                .map_err(|source| AcceptorError::AcceptError {
                    address: self.local_addr,
                    source,
                })?;

        let id = self.sessions.allocate();
        debug!(session = %id, peer = %peer, "New TCP connection");

        Ok(Session::new(id, stream, peer, self.remote_addr))
    }

    /// Accept forever, one supervised task per session.
    ///
    /// Only returns when accepting fails, which is fatal for the process.
    pub async fn run(mut self) -> Result<(), AcceptorError> {
        loop {
            let session = match self.accept().await {
                Ok(session) => session,
                Err(e) => {
                    error!("{}", e);
                    info!("Closing listener {}", self.local_addr);
                    return Err(e);
                }
            };

            tokio::spawn(supervise(session));
        }
    }
}

fn bind_listener(addr: SocketAddr, dual_stack: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(!dual_stack)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_error(addr: SocketAddr, e: io::Error) -> AcceptorError {
    AcceptorError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    }
}
