//! Pool lifecycle: create, resolve, tag, update and delete.
//!
//! A VM is addressed by its pool id. The backing instance is resolved from
//! the pool's status on every call and never cached, because the fleet API
//! may replace it at any time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, CloudApiError, Instance, InstanceState};
use crate::error::{CpiError, cloud_failure, fleet_failure};
use crate::instance::{NetworkKind, Networks};
use crate::registry::SettingsRegistry;
use crate::types::{InstanceId, VmId};
use crate::wait::{Poll, WaitPolicies, wait_for};

use super::builder::{self, InstanceParams, TagEntry, VmTypeProperties, format_tags};
use super::client::FleetApi;
use super::types::{
    ComputeUpdate, DeleteOptions, GroupUpdate, LaunchSpecificationUpdate, LoadBalancer,
    LoadBalancersConfig,
};

const NAME_TAG_KEY: &str = "Name";
const CLASSIC_LOAD_BALANCER: &str = "CLASSIC";

/// Result of [`FleetManager::delete`].
#[derive(Clone, Debug)]
pub struct PoolDeletion {
    /// Whether the fleet API still knew the pool.
    pub found: bool,
    /// Backing instance resolved before the deletion request.
    pub instance: Option<Instance>,
}

/// Orchestrates pool creation and teardown against the fleet API.
#[derive(Debug)]
pub struct FleetManager<F, C, R> {
    fleet: Arc<F>,
    cloud: Arc<C>,
    registry: Arc<R>,
    policies: WaitPolicies,
}

impl<F, C, R> Clone for FleetManager<F, C, R> {
    fn clone(&self) -> Self {
        Self {
            fleet: Arc::clone(&self.fleet),
            cloud: Arc::clone(&self.cloud),
            registry: Arc::clone(&self.registry),
            policies: self.policies,
        }
    }
}

impl<F, C, R> FleetManager<F, C, R>
where
    F: FleetApi,
    C: CloudApi,
    R: SettingsRegistry,
{
    /// Creates a manager over shared collaborators.
    #[must_use]
    pub const fn new(fleet: Arc<F>, cloud: Arc<C>, registry: Arc<R>, policies: WaitPolicies) -> Self {
        Self {
            fleet,
            cloud,
            registry,
            policies,
        }
    }

    /// Submits a new pool and waits until it reports a backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] for malformed parameters,
    /// [`CpiError::Cloud`] when the fleet API rejects the pool and
    /// [`CpiError::Timeout`] when no instance appears within the readiness
    /// budget. The pool is left in place on timeout.
    pub async fn create(
        &self,
        params: &InstanceParams,
        props: &VmTypeProperties,
    ) -> Result<(VmId, Instance), CpiError> {
        let spec = builder::build(params, props)?;
        let record = self
            .fleet
            .create_group(&spec)
            .await
            .map_err(|err| fleet_failure("create elastigroup", &spec.name, &err))?;
        let vm_id = VmId::new(record.id);
        info!(vm_id = %vm_id, name = %spec.name, "elastigroup created");

        let instance = wait_for(
            &self.policies.pool_readiness,
            vm_id.as_str(),
            "fulfilled",
            |_| self.probe_backing_instance(&vm_id),
        )
        .await?;
        info!(vm_id = %vm_id, instance_id = %instance.id, "elastigroup fulfilled");
        Ok((vm_id, instance))
    }

    async fn probe_backing_instance(&self, vm_id: &VmId) -> Poll<Instance, CpiError> {
        match self.resolve(vm_id).await {
            Ok(Some(instance)) => Poll::Ready(instance),
            Ok(None) => Poll::NotReady,
            Err(err) => Poll::Failed(err),
        }
    }

    /// Resolves the pool's current backing instance, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the fleet or cloud API fails; an
    /// absent pool or instance is `Ok(None)`.
    pub async fn resolve(&self, vm_id: &VmId) -> Result<Option<Instance>, CpiError> {
        let members = self
            .fleet
            .group_status(vm_id)
            .await
            .map_err(|err| fleet_failure("read elastigroup status", vm_id, &err))?;
        let Some(instance_id) = members
            .into_iter()
            .next()
            .and_then(|member| member.instance_id)
            .filter(|id| !id.is_empty())
            .map(InstanceId::new)
        else {
            debug!(vm_id = %vm_id, "elastigroup has no backing instance");
            return Ok(None);
        };

        match self.cloud.describe_instance(&instance_id).await {
            Ok(instance) => Ok(instance),
            Err(CloudApiError::InstanceNotFound { .. }) => Ok(None),
            Err(err) => Err(cloud_failure("describe instance", &instance_id, &err)),
        }
    }

    /// Deletes the pool, reclaiming its stateful resources. When the fleet
    /// API still knew the pool, waits for the backing instance to terminate.
    /// Registry records for the pool and its instance are erased on every
    /// path.
    ///
    /// An absent pool leaves any resolved instance running; it is returned
    /// so the caller can terminate it directly.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when deletion fails and
    /// [`CpiError::Timeout`] when the instance does not terminate in time.
    pub async fn delete(&self, vm_id: &VmId) -> Result<PoolDeletion, CpiError> {
        let mut resolved = None;
        let outcome = self.teardown(vm_id, &mut resolved).await;
        self.erase_settings(vm_id, resolved.as_ref());
        outcome
    }

    async fn teardown(
        &self,
        vm_id: &VmId,
        resolved: &mut Option<InstanceId>,
    ) -> Result<PoolDeletion, CpiError> {
        let instance = self.resolve(vm_id).await?;
        *resolved = instance.as_ref().map(|found| found.id.clone());

        let found = self
            .fleet
            .delete_group(vm_id, &DeleteOptions::reclaim_all())
            .await
            .map_err(|err| fleet_failure("delete elastigroup", vm_id, &err))?;
        info!(vm_id = %vm_id, found, "elastigroup deleted");

        if let Some(instance) = instance.as_ref().filter(|_| found) {
            self.wait_for_termination(&instance.id).await?;
        }
        Ok(PoolDeletion { found, instance })
    }

    fn erase_settings(&self, vm_id: &VmId, instance_id: Option<&InstanceId>) {
        let keys = std::iter::once(vm_id.as_str()).chain(instance_id.map(InstanceId::as_str));
        for key in keys {
            if let Err(err) = self.registry.delete(key) {
                warn!(key, error = %err, "failed to erase agent settings");
            }
        }
    }

    /// Waits until the instance is terminated or no longer visible.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when describing the instance fails and
    /// [`CpiError::Timeout`] when the budget runs out.
    pub async fn wait_for_termination(&self, instance_id: &InstanceId) -> Result<(), CpiError> {
        wait_for(
            &self.policies.instance,
            instance_id.as_str(),
            "terminated",
            |_| async move {
                match self.cloud.describe_instance(instance_id).await {
                    Ok(None) | Err(CloudApiError::InstanceNotFound { .. }) => Poll::Ready(()),
                    Ok(Some(instance)) if instance.state == InstanceState::Terminated => {
                        Poll::Ready(())
                    }
                    Ok(Some(_)) => Poll::NotReady,
                    Err(err) => Poll::Failed(cloud_failure("describe instance", instance_id, &err)),
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Replaces the pool's instance tags with caller metadata plus the
    /// injected cluster tag. Tags set at creation are not carried over. A
    /// non-empty `Name` entry also renames the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the update is rejected.
    pub async fn tag(&self, vm_id: &VmId, metadata: &[TagEntry]) -> Result<(), CpiError> {
        let name = metadata.iter().find_map(|entry| match entry {
            (Some(key), Some(value)) if key == NAME_TAG_KEY && !value.trim().is_empty() => {
                Some(value.clone())
            }
            _ => None,
        });
        let update = GroupUpdate {
            name,
            compute: Some(ComputeUpdate {
                launch_specification: Some(LaunchSpecificationUpdate {
                    tags: Some(format_tags(metadata)),
                    ..LaunchSpecificationUpdate::default()
                }),
                ..ComputeUpdate::default()
            }),
        };
        self.update(vm_id, "tag elastigroup", &update).await
    }

    /// Points the pool's elastic IP list at the VIP network's address.
    /// Does nothing when no VIP network is attached.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] when more than one VIP network is
    /// attached or the address is unknown, and [`CpiError::Cloud`] when a
    /// remote call fails.
    pub async fn associate_static_ip(
        &self,
        vm_id: &VmId,
        networks: &Networks,
    ) -> Result<(), CpiError> {
        let vips: Vec<_> = networks
            .values()
            .filter(|network| network.kind == NetworkKind::Vip)
            .collect();
        let vip = match vips.as_slice() {
            [] => return Ok(()),
            [vip] => *vip,
            _ => {
                return Err(CpiError::Validation(String::from(
                    "a VM may be attached to at most one vip network",
                )));
            }
        };
        let ip = vip
            .ip
            .as_deref()
            .ok_or_else(|| CpiError::Validation(String::from("vip network requires an ip")))?;

        let address = self
            .cloud
            .describe_address(ip)
            .await
            .map_err(|err| cloud_failure("describe address", ip, &err))?
            .ok_or_else(|| CpiError::Validation(format!("elastic IP {ip} not found")))?;

        let update = GroupUpdate {
            compute: Some(ComputeUpdate {
                elastic_ips: Some(vec![address.allocation_id]),
                ..ComputeUpdate::default()
            }),
            ..GroupUpdate::default()
        };
        self.update(vm_id, "associate elastic ip", &update).await?;
        info!(vm_id = %vm_id, ip, "elastic ip associated");
        Ok(())
    }

    /// Registers classic load balancers on the pool. Target groups are
    /// accepted but not yet sent to the fleet API.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the update is rejected.
    pub async fn register_load_balancers(
        &self,
        vm_id: &VmId,
        elbs: &[String],
        target_groups: &[String],
    ) -> Result<(), CpiError> {
        if !target_groups.is_empty() {
            // TODO: send target groups once the fleet request shape for them is settled.
            warn!(
                vm_id = %vm_id,
                count = target_groups.len(),
                "target group registration is not implemented; skipping"
            );
        }
        if elbs.is_empty() {
            return Ok(());
        }
        let update = GroupUpdate {
            compute: Some(ComputeUpdate {
                launch_specification: Some(LaunchSpecificationUpdate {
                    load_balancers_config: Some(LoadBalancersConfig {
                        load_balancers: elbs
                            .iter()
                            .map(|name| LoadBalancer {
                                name: name.clone(),
                                kind: String::from(CLASSIC_LOAD_BALANCER),
                            })
                            .collect(),
                    }),
                    ..LaunchSpecificationUpdate::default()
                }),
                ..ComputeUpdate::default()
            }),
            ..GroupUpdate::default()
        };
        self.update(vm_id, "register load balancers", &update).await
    }

    async fn update(
        &self,
        vm_id: &VmId,
        operation: &str,
        update: &GroupUpdate,
    ) -> Result<(), CpiError> {
        self.fleet
            .update_group(vm_id, update)
            .await
            .map_err(|err| fleet_failure(operation, vm_id, &err))?;
        Ok(())
    }
}
