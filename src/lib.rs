//! Core library for a cloud provider interface that runs VMs on spot-fleet
//! pools.
//!
//! A VM is identified by its fleet pool, not by the compute instance that
//! currently backs it, so the fleet may replace the instance (spot
//! interruption followed by fallback) without invalidating the orchestrator's
//! handle. The crate exposes the polling engine, the volume attach/detach
//! protocol, the fleet API client and pool lifecycle, and the VM and disk
//! managers composed behind [`Cpi`].

pub mod cloud;
pub mod config;
pub mod cpi;
pub mod disk;
pub mod error;
pub mod fleet;
pub mod instance;
pub mod registry;
pub mod test_support;
pub mod types;
pub mod volume;
pub mod wait;

pub use cloud::{CloudApi, CloudApiError, CloudFuture, Instance, InstanceState, Volume};
pub use config::{ConfigError, CpiConfig};
pub use cpi::{Cpi, CpiOptions};
pub use disk::{DiskManager, DiskProperties};
pub use error::CpiError;
pub use fleet::{
    FleetApi, FleetClient, FleetCredentials, FleetError, FleetManager, InstanceParams,
    InstanceParamsBuilder, PoolDeletion, TagEntry, VmTypeProperties,
};
pub use instance::{
    InstanceDefaults, InstanceManager, Network, NetworkKind, Networks, VmCreateRequest, VmType,
};
pub use registry::{
    AgentSettings, FileRegistry, MemoryRegistry, RegistryError, SettingsRegistry,
};
pub use types::{DiskId, InstanceId, VmId};
pub use volume::VolumeManager;
pub use wait::{Poll, WaitError, WaitPolicies, WaitPolicy, wait_for};
