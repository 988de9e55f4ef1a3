//! RESP2 wire support for driving Redis nodes during topology setup.
//!
//! Only what cluster coordination needs lives here:
//! - [`Frame`] values with an incremental parser and a serializer
//! - [`AdminClient`], a single-connection client for the `CLUSTER`
//!   administrative commands plus `AUTH` and `PING`

pub mod client;
pub mod error;
pub mod frame;
pub mod parse;

pub use client::{AdminClient, ClusterInfo};
pub use error::{Result, WireError};
pub use frame::Frame;
pub use parse::parse_frame;
