//! Forwards real-time performance counter samples to InfluxDB
//!
//! Samples are encoded as line-protocol points and sent either as UDP
//! datagrams or in batches over the HTTP API. The transport, its targets and
//! the measurement name follow a configuration store and can change while
//! samples are flowing.

pub mod config;
pub mod error;
pub mod plugin;
pub mod point;
pub mod registry;
pub mod sample;
pub mod store;
pub mod transport;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::config::{TransportConfig, TransportMode};
    pub use crate::error::{ForwarderError, Result};
    pub use crate::plugin::{ForwardingPlugin, StatsSnapshot};
    pub use crate::point::{EncodedPoint, PointEncoder};
    pub use crate::registry::{ObjectInfo, ObjectRegistry, StaticRegistry};
    pub use crate::sample::{CounterSample, FieldValue, TimeType};
    pub use crate::store::{ConfigSource, ConfigStore, FileConfigStore, MemoryConfigStore};
    pub use crate::transport::{
        BatchPolicy, BatchedHttpTransport, BatchedTransport, DatagramTransport, UdpTransport,
    };
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
