//! Configuration side of the streamd node daemon.
//!
//! - [`stream`]: raw stream specs, the field registry and validator, stream
//!   identity and the typed-config factory
//! - [`config`]: node settings file
//! - [`license`]: expiring license keys

pub mod config;
pub mod license;
pub mod stream;

mod error;

pub use error::{Error, Result};
