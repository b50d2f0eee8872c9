//! Facade exposing the VM and disk operations an orchestrator calls.
//!
//! Every VM-scoped disk operation resolves the VM's backing instance afresh,
//! so a spot replacement between calls is picked up transparently.

use std::sync::Arc;

use tracing::debug;

use crate::cloud::{CloudApi, Instance};
use crate::config::CpiConfig;
use crate::disk::{DiskManager, DiskProperties, list_disks};
use crate::error::CpiError;
use crate::fleet::{FleetApi, FleetClient, FleetManager, TagEntry};
use crate::instance::{InstanceDefaults, InstanceManager, VmCreateRequest};
use crate::registry::{FileRegistry, SettingsRegistry};
use crate::types::{DiskId, VmId};
use crate::wait::WaitPolicies;

/// Tunables shared by the managers behind [`Cpi`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CpiOptions {
    /// Fallbacks for VM creation and disk placement.
    pub defaults: InstanceDefaults,
    /// Skip waiting for confirmed removal of volumes and instances.
    pub fast_path_delete: bool,
    /// Polling budgets.
    pub policies: WaitPolicies,
}

impl CpiOptions {
    /// Derives options from configuration with production wait policies.
    #[must_use]
    pub fn from_config(config: &CpiConfig) -> Self {
        Self {
            defaults: InstanceDefaults::from_config(config),
            fast_path_delete: config.fast_path_delete,
            policies: WaitPolicies::default(),
        }
    }
}

/// Entry point composing the instance and disk managers.
#[derive(Debug)]
pub struct Cpi<F, C, R> {
    instances: InstanceManager<F, C, R>,
    disks: DiskManager<C, R>,
    fast_path_delete: bool,
}

impl<C, R> Cpi<FleetClient, C, R>
where
    C: CloudApi,
    R: SettingsRegistry,
{
    /// Validates configuration and wires an HTTP fleet client.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Config`] when configuration is incomplete or the
    /// HTTP client cannot be built.
    pub fn from_config(
        config: &CpiConfig,
        cloud: Arc<C>,
        registry: Arc<R>,
    ) -> Result<Self, CpiError> {
        config.validate()?;
        let fleet =
            FleetClient::from_config(config).map_err(|err| CpiError::Config(err.to_string()))?;
        Ok(Self::new(
            Arc::new(fleet),
            cloud,
            registry,
            CpiOptions::from_config(config),
        ))
    }
}

impl<C: CloudApi> Cpi<FleetClient, C, FileRegistry> {
    /// Like [`Cpi::from_config`], storing agent settings under the
    /// configured `registry_path`.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Config`] when `registry_path` is unset or the
    /// rest of the configuration is invalid.
    pub fn from_config_with_file_registry(
        config: &CpiConfig,
        cloud: Arc<C>,
    ) -> Result<Self, CpiError> {
        let registry = FileRegistry::from_config(config).ok_or_else(|| {
            CpiError::Config(String::from(
                "missing registry path: set CPI_REGISTRY_PATH or add registry_path to fleet-cpi.toml",
            ))
        })?;
        Self::from_config(config, cloud, Arc::new(registry))
    }
}

impl<F, C, R> Cpi<F, C, R>
where
    F: FleetApi,
    C: CloudApi,
    R: SettingsRegistry,
{
    /// Composes the managers over shared collaborators.
    #[must_use]
    pub fn new(fleet: Arc<F>, cloud: Arc<C>, registry: Arc<R>, options: CpiOptions) -> Self {
        let CpiOptions {
            defaults,
            fast_path_delete,
            policies,
        } = options;
        let fleet_manager =
            FleetManager::new(fleet, Arc::clone(&cloud), Arc::clone(&registry), policies);
        let disks = DiskManager::new(Arc::clone(&cloud), registry, policies)
            .with_fast_path_delete(fast_path_delete)
            .with_default_availability_zone(defaults.availability_zone.clone());
        Self {
            instances: InstanceManager::new(fleet_manager, cloud, defaults, policies),
            disks,
            fast_path_delete,
        }
    }

    /// Creates a VM and returns its pool identity.
    ///
    /// # Errors
    ///
    /// See [`InstanceManager::create`].
    pub async fn create_vm(&self, request: &VmCreateRequest) -> Result<VmId, CpiError> {
        self.instances.create(request).await
    }

    /// Resolves the VM's current backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when a lookup fails.
    pub async fn find_vm(&self, vm_id: &VmId) -> Result<Option<Instance>, CpiError> {
        self.instances.find(vm_id).await
    }

    /// Reports whether the VM currently has a backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when a lookup fails.
    pub async fn has_vm(&self, vm_id: &VmId) -> Result<bool, CpiError> {
        self.instances.has_vm(vm_id).await
    }

    /// Deletes the VM's pool and its backing instance.
    ///
    /// # Errors
    ///
    /// See [`InstanceManager::delete`].
    pub async fn delete_vm(&self, vm_id: &VmId) -> Result<(), CpiError> {
        self.instances.delete(vm_id, self.fast_path_delete).await
    }

    /// Applies caller metadata to the VM's pool.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the update is rejected.
    pub async fn set_vm_metadata(&self, vm_id: &VmId, metadata: &[TagEntry]) -> Result<(), CpiError> {
        self.instances.set_metadata(vm_id, metadata).await
    }

    /// Creates a disk, next to `vm_id` when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] when the VM has no backing instance
    /// and otherwise see [`DiskManager::create`].
    pub async fn create_disk(
        &self,
        size_mib: u64,
        props: &DiskProperties,
        vm_id: Option<&VmId>,
    ) -> Result<DiskId, CpiError> {
        let owner = match vm_id {
            Some(vm_id) => Some(self.require_instance(vm_id).await?),
            None => None,
        };
        self.disks.create(size_mib, props, owner.as_ref()).await
    }

    /// Deletes a disk.
    ///
    /// # Errors
    ///
    /// See [`DiskManager::delete`].
    pub async fn delete_disk(&self, disk_id: &DiskId) -> Result<(), CpiError> {
        self.disks.delete(disk_id).await
    }

    /// Attaches a disk to the VM and returns the device name.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] when the VM has no backing instance
    /// and otherwise see [`DiskManager::attach`].
    pub async fn attach_disk(&self, vm_id: &VmId, disk_id: &DiskId) -> Result<String, CpiError> {
        let instance = self.require_instance(vm_id).await?;
        self.disks.attach(&instance, disk_id).await
    }

    /// Detaches a disk from the VM.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] when the VM has no backing instance
    /// and otherwise see [`DiskManager::detach`].
    pub async fn detach_disk(&self, vm_id: &VmId, disk_id: &DiskId) -> Result<(), CpiError> {
        let instance = self.require_instance(vm_id).await?;
        self.disks.detach(&instance, disk_id).await
    }

    /// Reports whether the disk exists.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the lookup fails.
    pub async fn has_disk(&self, disk_id: &DiskId) -> Result<bool, CpiError> {
        self.disks.has_disk(disk_id).await
    }

    /// Lists the disks currently mapped on the VM's backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] when the VM has no backing instance.
    pub async fn get_disks(&self, vm_id: &VmId) -> Result<Vec<DiskId>, CpiError> {
        let instance = self.require_instance(vm_id).await?;
        Ok(list_disks(&instance))
    }

    /// Applies tags to a disk.
    ///
    /// # Errors
    ///
    /// See [`DiskManager::set_metadata`].
    pub async fn set_disk_metadata(
        &self,
        disk_id: &DiskId,
        metadata: &[(String, String)],
    ) -> Result<(), CpiError> {
        self.disks.set_metadata(disk_id, metadata).await
    }

    async fn require_instance(&self, vm_id: &VmId) -> Result<Instance, CpiError> {
        let instance = self.instances.find(vm_id).await?;
        debug!(vm_id = %vm_id, found = instance.is_some(), "resolved backing instance");
        instance.ok_or_else(|| CpiError::VmNotFound {
            vm_id: vm_id.to_string(),
        })
    }
}
