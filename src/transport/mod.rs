//! Delivery of encoded points to the database
mod datagram;
pub mod http;

use crate::config::{Endpoint, HttpSettings, LocalBind};
use crate::error::Result;
use crate::point::EncodedPoint;

pub use datagram::UdpTransport;
pub use http::{BatchPolicy, BatchedHttpTransport, Connector, InfluxConnector, WriteClient};

/// Connectionless, fire-and-forget delivery of line-protocol text
pub trait DatagramTransport: Send + Sync + 'static {
    /// Close the current socket, bind a new one and set the destination
    fn configure(&self, local: &LocalBind, target: &Endpoint) -> Result<()>;

    /// Send one line as a single datagram
    fn send(&self, line: &str) -> Result<()>;

    /// Close the socket; sends fail until the next `configure`
    fn shutdown(&self);
}

/// Buffered delivery of points over request/response
pub trait BatchedTransport: Send + Sync + 'static {
    /// Connect to a new endpoint and make sure the database exists
    fn configure(&self, settings: &HttpSettings) -> Result<()>;

    /// Queue a point for the given database and retention policy
    fn send(&self, point: &EncodedPoint, database: &str, retention_policy: &str) -> Result<()>;

    /// Stop the background flusher; sends fail until the next `configure`
    fn shutdown(&self);
}
