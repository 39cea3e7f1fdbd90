//! # strata-core
//!
//! Core abstractions shared across the Strata catalog metadata store:
//!
//! - **Realm**: the isolation boundary every call is scoped to
//! - **Call Context**: realm + clock + diagnostics + configuration bundle
//!   handed to every persistence and manager operation
//! - **Clock**: epoch-millis time source, swappable for simulated time
//! - **Diagnostics**: programmer-error invariant checks
//! - **Error Types**: shared infrastructure error definitions
//!
//! ## Crate Boundary
//!
//! `strata-core` is the only crate allowed to define shared primitives.
//! Domain types (entities, grants, persistence contracts) live in
//! `strata-metastore` and build on top of these.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod observability;
pub mod realm;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::ConfigurationStore;
pub use context::CallContext;
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use observability::{init_logging, LogFormat};
pub use realm::RealmId;
