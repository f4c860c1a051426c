pub mod channel;
pub mod command;
pub mod config;
pub mod dns;
pub mod error;
pub mod feedback;
pub mod homie;
pub mod ports;
pub mod provisioning;
pub mod runtime;
pub mod scan;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChannelRegistry, Property, MAX_CHANNELS};
pub use config::{DeviceProfile, ModuleConfig, RetryPolicy, RuntimeConfig};
pub use error::{CommandError, FsError, LinkError, RadioError, RegistryError, StoreError};
pub use ports::*;
pub use runtime::DeviceRuntime;
pub use scan::AccessPoint;
pub use topics::*;
pub use types::{Direction, NodeStatus, QoS, RuntimePhase, SessionState, StationStatus};
