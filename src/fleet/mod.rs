//! Fleet API integration: wire model, HTTP client, pool builder and the
//! pool lifecycle manager.

pub mod builder;
pub mod client;
pub mod manager;
pub mod types;

pub use builder::{InstanceParams, InstanceParamsBuilder, TagEntry, VmTypeProperties};
pub use client::{FleetApi, FleetClient, FleetCredentials, FleetError, FleetFuture};
pub use manager::{FleetManager, PoolDeletion};
