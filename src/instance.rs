//! VM lifecycle on top of the fleet manager: parameter building, creation
//! with post-configuration, lookup and deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cloud::{CloudApi, CloudApiError, Instance, InstanceState};
use crate::config::CpiConfig;
use crate::error::{CpiError, cloud_failure};
use crate::fleet::builder::{InstanceParams, TagEntry, VmTypeProperties};
use crate::fleet::types::{BlockDeviceSpec, EbsSpec};
use crate::fleet::{FleetApi, FleetManager};
use crate::registry::SettingsRegistry;
use crate::types::{DiskId, InstanceId, VmId};
use crate::wait::{Poll, WaitPolicies, wait_for};

const ABRUPT_TERMINATION_RETRIES: u32 = 2;
const ROOT_DEVICE_NAME: &str = "/dev/xvda";
const AGENT_ID_TAG_KEY: &str = "agent_id";

/// Kind of network a VM is attached to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// Address assigned by the subnet.
    Dynamic,
    /// Static private address.
    Manual,
    /// Public elastic address.
    Vip,
}

/// One network attachment requested by the orchestrator.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Network {
    /// Network kind.
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    /// Static address for manual and vip networks.
    #[serde(default)]
    pub ip: Option<String>,
    /// Subnet for dynamic and manual networks.
    #[serde(default)]
    pub subnet_id: Option<String>,
    /// Security groups required by the network.
    #[serde(default)]
    pub security_groups: Vec<String>,
}

/// Networks keyed by orchestrator network name.
pub type Networks = BTreeMap<String, Network>;

/// Root disk overrides.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct EphemeralDisk {
    /// Size in GiB.
    pub size_gib: u64,
    /// Volume type.
    #[serde(default = "default_ephemeral_type")]
    pub volume_type: String,
}

fn default_ephemeral_type() -> String {
    String::from("gp3")
}

/// Orchestrator VM type (cloud properties).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VmType {
    /// Comma-separated candidate instance types.
    pub instance_type: String,
    /// Key pair.
    #[serde(default)]
    pub key_name: Option<String>,
    /// Pinned availability zone.
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Security groups used when the networks name none.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Instance profile.
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    /// Associate an ephemeral public IP.
    #[serde(default)]
    pub auto_assign_public_ip: bool,
    /// Root disk overrides.
    #[serde(default)]
    pub ephemeral_disk: Option<EphemeralDisk>,
    /// Fleet strategy and post-configuration properties.
    #[serde(flatten)]
    pub fleet: VmTypeProperties,
}

/// Everything needed to create one VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmCreateRequest {
    /// Agent identifier, used for tagging.
    pub agent_id: String,
    /// Machine image.
    pub image_id: String,
    /// VM type.
    pub vm_type: VmType,
    /// Network attachments.
    pub networks: Networks,
    /// Disks the VM should be placed next to.
    pub disk_locality: Vec<DiskId>,
    /// Agent bootstrap payload.
    pub user_data: Option<String>,
    /// Caller metadata applied as tags.
    pub tags: Vec<TagEntry>,
}

/// Fallback values applied when the VM type leaves a field empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceDefaults {
    /// Zone used when nothing pins one.
    pub availability_zone: Option<String>,
    /// Key pair.
    pub key_name: Option<String>,
    /// Security groups.
    pub security_groups: Vec<String>,
    /// Instance profile.
    pub iam_instance_profile: Option<String>,
}

impl InstanceDefaults {
    /// Extracts defaults from configuration.
    #[must_use]
    pub fn from_config(config: &CpiConfig) -> Self {
        Self {
            availability_zone: config.default_availability_zone.clone(),
            key_name: config.default_key_name.clone(),
            security_groups: config.security_groups(),
            iam_instance_profile: config.default_iam_instance_profile.clone(),
        }
    }
}

/// Picks the single zone implied by disks, subnets and the VM type.
///
/// # Errors
///
/// Returns [`CpiError::Validation`] when the hints disagree or nothing,
/// including the default, names a zone.
pub fn select_availability_zone(
    zones: &BTreeSet<String>,
    default: Option<&str>,
) -> Result<String, CpiError> {
    let mut candidates = zones.iter();
    match (candidates.next(), candidates.next()) {
        (Some(zone), None) => Ok(zone.clone()),
        (None, _) => default.map(str::to_owned).ok_or_else(|| {
            CpiError::Validation(String::from(
                "no availability zone: set one on the VM type or default_availability_zone",
            ))
        }),
        (Some(_), Some(_)) => Err(CpiError::Validation(format!(
            "conflicting availability zones: {}",
            zones.iter().cloned().collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Creates, resolves and deletes VMs.
#[derive(Debug)]
pub struct InstanceManager<F, C, R> {
    fleet: FleetManager<F, C, R>,
    cloud: Arc<C>,
    defaults: InstanceDefaults,
    policies: WaitPolicies,
}

impl<F, C, R> InstanceManager<F, C, R>
where
    F: FleetApi,
    C: CloudApi,
    R: SettingsRegistry,
{
    /// Creates a manager over a fleet manager sharing the same cloud client.
    #[must_use]
    pub const fn new(
        fleet: FleetManager<F, C, R>,
        cloud: Arc<C>,
        defaults: InstanceDefaults,
        policies: WaitPolicies,
    ) -> Self {
        Self {
            fleet,
            cloud,
            defaults,
            policies,
        }
    }

    /// Resolves placement and defaults into validated fleet parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] when no usable network or zone
    /// exists, [`CpiError::DiskNotFound`] for an unknown locality disk and
    /// [`CpiError::Cloud`] when a lookup fails.
    pub async fn build_params(&self, request: &VmCreateRequest) -> Result<InstanceParams, CpiError> {
        let primary = request
            .networks
            .values()
            .find(|network| network.kind != NetworkKind::Vip)
            .ok_or_else(|| {
                CpiError::Validation(String::from("a dynamic or manual network is required"))
            })?;
        let subnet_id = primary
            .subnet_id
            .clone()
            .ok_or_else(|| CpiError::Validation(String::from("network is missing subnet_id")))?;

        let zones = self.placement_zones(request).await?;
        let availability_zone =
            select_availability_zone(&zones, self.defaults.availability_zone.as_deref())?;

        let vm_type = &request.vm_type;
        let private_ip = match primary.kind {
            NetworkKind::Manual => primary.ip.clone(),
            NetworkKind::Dynamic | NetworkKind::Vip => None,
        };

        let mut builder = InstanceParams::builder()
            .image_id(&request.image_id)
            .instance_type(&vm_type.instance_type)
            .availability_zone(availability_zone)
            .subnet_id(subnet_id)
            .private_ip(private_ip)
            .associate_public_ip(vm_type.auto_assign_public_ip)
            .key_name(
                vm_type
                    .key_name
                    .clone()
                    .or_else(|| self.defaults.key_name.clone()),
            )
            .user_data(request.user_data.clone())
            .security_groups(self.security_groups(request))
            .iam_instance_profile(
                vm_type
                    .iam_instance_profile
                    .clone()
                    .or_else(|| self.defaults.iam_instance_profile.clone()),
            )
            .tags(request.tags.iter().cloned())
            .tags([(
                Some(String::from(AGENT_ID_TAG_KEY)),
                Some(request.agent_id.clone()),
            )])
            .description(format!("bosh vm {}", request.agent_id));
        if let Some(disk) = &vm_type.ephemeral_disk {
            builder = builder.block_device(BlockDeviceSpec {
                device_name: String::from(ROOT_DEVICE_NAME),
                ebs: Some(EbsSpec {
                    volume_size: disk.size_gib,
                    volume_type: disk.volume_type.clone(),
                    delete_on_termination: true,
                    iops: None,
                }),
                virtual_name: None,
            });
        }
        builder.build()
    }

    async fn placement_zones(&self, request: &VmCreateRequest) -> Result<BTreeSet<String>, CpiError> {
        let mut zones = BTreeSet::new();
        for disk_id in &request.disk_locality {
            let volume = self
                .cloud
                .describe_volume(disk_id)
                .await
                .map_err(|err| match err {
                    CloudApiError::VolumeNotFound { .. } => CpiError::DiskNotFound {
                        disk_id: disk_id.to_string(),
                    },
                    other => cloud_failure("describe volume", disk_id, &other),
                })?;
            zones.insert(volume.availability_zone);
        }
        let subnets = request
            .networks
            .values()
            .filter(|network| network.kind != NetworkKind::Vip)
            .filter_map(|network| network.subnet_id.as_deref());
        for subnet_id in subnets {
            let subnet = self
                .cloud
                .describe_subnet(subnet_id)
                .await
                .map_err(|err| cloud_failure("describe subnet", subnet_id, &err))?;
            zones.insert(subnet.availability_zone);
        }
        if let Some(zone) = &request.vm_type.availability_zone {
            zones.insert(zone.clone());
        }
        Ok(zones)
    }

    fn security_groups(&self, request: &VmCreateRequest) -> Vec<String> {
        let from_networks: BTreeSet<String> = request
            .networks
            .values()
            .flat_map(|network| network.security_groups.iter().cloned())
            .collect();
        if !from_networks.is_empty() {
            return from_networks.into_iter().collect();
        }
        if !request.vm_type.security_groups.is_empty() {
            return request.vm_type.security_groups.clone();
        }
        self.defaults.security_groups.clone()
    }

    /// Creates a VM and post-configures its instance.
    ///
    /// A post-configuration failure deletes the half-configured VM; cleanup
    /// failures are logged and the original error is returned. An instance
    /// terminated before configuration finished restarts the whole
    /// creation, at most twice.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable [`CpiError`], or
    /// [`CpiError::AbruptlyTerminated`] once retries are exhausted.
    pub async fn create(&self, request: &VmCreateRequest) -> Result<VmId, CpiError> {
        let mut retries = 0;
        loop {
            match self.create_once(request).await {
                Err(CpiError::AbruptlyTerminated { instance_id })
                    if retries < ABRUPT_TERMINATION_RETRIES =>
                {
                    retries += 1;
                    info!(
                        agent_id = %request.agent_id,
                        instance_id = %instance_id,
                        retry = retries,
                        "instance terminated during creation; retrying"
                    );
                }
                outcome => return outcome,
            }
        }
    }

    async fn create_once(&self, request: &VmCreateRequest) -> Result<VmId, CpiError> {
        let params = self.build_params(request).await?;
        let (vm_id, instance) = self.fleet.create(&params, &request.vm_type.fleet).await?;
        match self.post_configure(&vm_id, &instance.id, request).await {
            Ok(()) => {
                info!(vm_id = %vm_id, instance_id = %instance.id, "vm created");
                Ok(vm_id)
            }
            Err(err) => {
                self.rollback(&vm_id, &err).await;
                Err(err)
            }
        }
    }

    async fn post_configure(
        &self,
        vm_id: &VmId,
        instance_id: &InstanceId,
        request: &VmCreateRequest,
    ) -> Result<(), CpiError> {
        self.wait_for_running(instance_id).await?;
        let props = &request.vm_type.fleet;
        for route in &props.advertised_routes {
            self.cloud
                .replace_route(&route.table_id, &route.destination, instance_id)
                .await
                .map_err(|err| cloud_failure("replace route", &route.table_id, &err))?;
        }
        if !props.source_dest_check {
            self.cloud
                .modify_source_dest_check(instance_id, false)
                .await
                .map_err(|err| cloud_failure("disable source/dest check", instance_id, &err))?;
        }
        self.fleet
            .associate_static_ip(vm_id, &request.networks)
            .await?;
        self.fleet
            .register_load_balancers(vm_id, &props.elbs, &props.target_groups)
            .await
    }

    async fn rollback(&self, vm_id: &VmId, cause: &CpiError) {
        warn!(vm_id = %vm_id, error = %cause, "post-configuration failed; deleting vm");
        if let Err(err) = self.delete(vm_id, false).await {
            warn!(vm_id = %vm_id, error = %err, "failed to delete vm after failed creation");
        }
    }

    async fn wait_for_running(&self, instance_id: &InstanceId) -> Result<Instance, CpiError> {
        let cloud = &self.cloud;
        let instance = wait_for(
            &self.policies.instance,
            instance_id.as_str(),
            "running",
            |_| async move {
                match cloud.describe_instance(instance_id).await {
                    Ok(Some(instance)) if instance.state == InstanceState::Running => {
                        Poll::Ready(instance)
                    }
                    Ok(Some(instance)) if instance.state.is_terminal() => {
                        Poll::Failed(CpiError::AbruptlyTerminated {
                            instance_id: instance_id.to_string(),
                        })
                    }
                    Ok(_) | Err(CloudApiError::InstanceNotFound { .. }) => Poll::NotReady,
                    Err(err) => Poll::Failed(cloud_failure("describe instance", instance_id, &err)),
                }
            },
        )
        .await?;
        Ok(instance)
    }

    /// Resolves the VM's current backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when a lookup fails.
    pub async fn find(&self, vm_id: &VmId) -> Result<Option<Instance>, CpiError> {
        self.fleet.resolve(vm_id).await
    }

    /// Reports whether the VM currently has a backing instance.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when a lookup fails.
    pub async fn has_vm(&self, vm_id: &VmId) -> Result<bool, CpiError> {
        Ok(self.find(vm_id).await?.is_some())
    }

    /// Deletes the VM's pool. When the fleet no longer knows the pool, the
    /// instance resolved before deletion is terminated directly.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] or [`CpiError::Timeout`] when teardown
    /// fails.
    pub async fn delete(&self, vm_id: &VmId, fast: bool) -> Result<(), CpiError> {
        let deletion = self.fleet.delete(vm_id).await?;
        if deletion.found {
            return Ok(());
        }
        match deletion.instance {
            Some(instance) => {
                info!(
                    vm_id = %vm_id,
                    instance_id = %instance.id,
                    "elastigroup gone; terminating orphaned instance"
                );
                self.terminate_instance(&instance, fast).await
            }
            None => {
                info!(vm_id = %vm_id, "vm already gone");
                Ok(())
            }
        }
    }

    /// Terminates an instance, waiting for termination unless `fast`.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] or [`CpiError::Timeout`] when
    /// termination fails.
    pub async fn terminate_instance(&self, instance: &Instance, fast: bool) -> Result<(), CpiError> {
        match self.cloud.terminate_instance(&instance.id).await {
            Ok(()) => {}
            Err(CloudApiError::InstanceNotFound { .. }) => {
                info!(instance_id = %instance.id, "instance already gone");
                return Ok(());
            }
            Err(err) => return Err(cloud_failure("terminate instance", &instance.id, &err)),
        }
        if !fast {
            self.fleet.wait_for_termination(&instance.id).await?;
        }
        info!(instance_id = %instance.id, fast, "instance terminated");
        Ok(())
    }

    /// Pushes metadata onto the VM's pool.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the update is rejected.
    pub async fn set_metadata(&self, vm_id: &VmId, metadata: &[TagEntry]) -> Result<(), CpiError> {
        self.fleet.tag(vm_id, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|zone| (*zone).to_owned()).collect()
    }

    #[test]
    fn single_hint_wins_over_default() {
        let zone = select_availability_zone(&zones(&["us-east-1b"]), Some("us-east-1a"))
            .unwrap_or_else(|err| panic!("zone: {err}"));
        assert_eq!(zone, "us-east-1b");
    }

    #[test]
    fn default_applies_without_hints() {
        let zone = select_availability_zone(&zones(&[]), Some("us-east-1a"))
            .unwrap_or_else(|err| panic!("zone: {err}"));
        assert_eq!(zone, "us-east-1a");
        assert!(select_availability_zone(&zones(&[]), None).is_err());
    }

    #[test]
    fn conflicting_hints_are_rejected() {
        let err = select_availability_zone(&zones(&["us-east-1a", "us-east-1b"]), None)
            .expect_err("conflict should fail");
        assert_eq!(
            err,
            CpiError::Validation(String::from(
                "conflicting availability zones: us-east-1a, us-east-1b"
            ))
        );
    }

    #[test]
    fn vm_type_reads_fleet_properties_inline() {
        let vm_type: VmType = serde_json::from_value(serde_json::json!({
            "instance_type": "m5.large,m5a.large",
            "risk": 20,
            "orientation": "costOriented",
            "source_dest_check": false
        }))
        .unwrap_or_else(|err| panic!("vm type: {err}"));
        assert_eq!(vm_type.fleet.risk, 20);
        assert!(!vm_type.fleet.source_dest_check);
        assert!(vm_type.fleet.fallback_to_od);
    }
}
