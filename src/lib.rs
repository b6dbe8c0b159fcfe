//! Best-effort proof-of-execution (PoE) emission
//!
//! Business code calls [`Emitter::emit`] with a request id and the input and
//! output of a finished operation. The record is built on the caller's thread
//! and POSTed to a sidecar collector in the background. The call never blocks
//! on the network and never reports failure; problems only show up in the log.

pub mod config;
pub mod emitter;
pub mod error;
pub mod record;
pub mod timer;
pub mod transport;

pub use config::{Config, LogLevel, SidecarConfig};
pub use emitter::{Emitter, Outcome};
pub use error::EmitError;
pub use record::{FieldCase, Identity, PoeRecord};
pub use timer::{Deadline, DeadlineTimer};
pub use transport::{Delivery, HttpTransport, Transport};
