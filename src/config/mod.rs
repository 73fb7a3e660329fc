//! Configuration
//!
//! Library settings, host identity resolution and the persisted topology
//! document.

pub mod host;
pub mod persistence;
pub mod settings;

pub use host::{HostIdentity, HostIdentitySources, UUID_NQN_PREFIX};
pub use persistence::ConfigStore;
pub use settings::{LibraryConfig, DEFAULT_CONFIG_PATH};
