//! TCP relay core
//!
//! Accepts inbound TCP connections and relays each one, byte for byte, to a
//! fixed remote address. Every accepted connection becomes a session with
//! two relay directions, half-close propagation between them, and a
//! supervisor that keeps one session's failure away from every other.

pub mod acceptor;
pub mod config;
pub mod copier;
pub mod error;
pub mod session;
pub mod supervisor;

pub use acceptor::{AcceptorError, RelayServer, SessionCounter};
pub use config::{AddressFamily, ConfigError, RelayConfig, RelayOptions};
pub use copier::{CopyOutcome, Direction};
pub use error::RelayError;
pub use session::{
    relay_streams, Endpoint, Session, SessionId, SessionState, SessionSummary, SplitStream,
};
pub use supervisor::{supervise, supervise_engine, SessionStatus};
