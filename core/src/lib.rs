//! Shared types for the tunnelrank engine: endpoint descriptors, the error
//! taxonomy and the concurrency-safe local port allocator.

pub mod descriptor;
pub mod error;
pub mod ports;

pub use descriptor::{EndpointDescriptor, Security, Transport};
pub use error::{RankError, Result};
pub use ports::{LocalBinding, PortAllocator, PortClaim};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
