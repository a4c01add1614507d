//! portbridge: local network bootstrap for debug sessions.
//! Allocates free local TCP ports for debug server child processes (with a
//! short-lived lease so concurrent callers never share a port) and relays a
//! stdin/stdout pair to the debug server's TCP socket once it is listening.

pub mod allocator;
pub mod config;
pub mod error;
pub mod hosts;
pub mod lease;
pub mod probe;
pub mod range;
pub mod relay;

pub use allocator::{AllocationRequest, PortAllocator};
pub use config::{AllocatorConfig, BridgeConfig, RelayConfig};
pub use error::{BridgeError, Result};
pub use hosts::{BindHost, local_hosts};
pub use lease::{DEFAULT_LEASE_INTERVAL, LeaseRegistry, PortLease, spawn_aging_task};
pub use probe::probe;
pub use range::{MAX_PORT, MIN_PORT, PortNumbers, parse_port, parse_port_list, port_numbers};
pub use relay::{
    ConnectionRelay, DEFAULT_RELAY_PORT, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, RelayOutcome,
    RelaySession, RelayState,
};
