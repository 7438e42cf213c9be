//! Control-plane daemon of a streamd media node.
//!
//! Accepts control connections, supervises one worker process per stream,
//! serves the HLS, VOD and COD sites and starts on-demand workers when their
//! content is requested.

pub mod command;
pub mod error;
pub(crate) mod handlers;
pub mod housekeeping;
pub mod http;
pub mod links;
pub(crate) mod outbound;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod supervisor;
pub mod uploads;

pub use error::{DaemonError, Result};
pub use http::{LazyStart, SiteKind, TriggerOutcome};
pub use links::LinkIndex;
pub use server::{Daemon, DaemonState, run};
pub use session::{AccessLevel, ClientSession, SessionId};
pub use supervisor::Supervisor;
