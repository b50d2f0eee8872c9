//! Persistent disk lifecycle and the per-instance persistent-disk record.
//!
//! The record update that follows an attach or detach is not transactional
//! with the cloud-side operation. A crash between the two leaves the record
//! stale until the next attach or detach of that disk rewrites it.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cloud::{CloudApi, CloudApiError, CreateVolumeRequest, Instance, VolumeState};
use crate::error::{CpiError, cloud_failure};
use crate::registry::{SettingsRegistry, update_settings};
use crate::types::DiskId;
use crate::volume::VolumeManager;
use crate::wait::{Poll, WaitPolicies, wait_for};

const MIB_PER_GIB: u64 = 1024;
const MIN_SIZE_GIB: u64 = 1;
const MAX_SIZE_GIB: u64 = 16 * 1024;
const DELETE_MARKER_KEY: &str = "Name";
const DELETE_MARKER_VALUE: &str = "to be deleted";
const PROVISIONED_IOPS_TYPES: [&str; 2] = ["io1", "io2"];

/// Orchestrator-supplied disk properties.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskProperties {
    /// Volume type, for example `gp3` or `io1`.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Provisioned IOPS; required for `io1` and `io2`.
    pub iops: Option<u32>,
    /// Encrypt the volume at rest.
    pub encrypted: bool,
    /// Customer managed encryption key.
    pub kms_key_arn: Option<String>,
}

impl Default for DiskProperties {
    fn default() -> Self {
        Self {
            volume_type: String::from("gp3"),
            iops: None,
            encrypted: false,
            kms_key_arn: None,
        }
    }
}

impl DiskProperties {
    /// Rejects incomplete properties.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] when the type is empty or a
    /// provisioned-IOPS type has no IOPS value.
    pub fn validate(&self) -> Result<(), CpiError> {
        if self.volume_type.trim().is_empty() {
            return Err(CpiError::Validation(String::from("missing disk type")));
        }
        if PROVISIONED_IOPS_TYPES.contains(&self.volume_type.as_str()) && self.iops.is_none() {
            return Err(CpiError::Validation(format!(
                "disk type {} requires iops",
                self.volume_type
            )));
        }
        Ok(())
    }
}

/// Converts a size in MiB to whole GiB, rounding up.
///
/// # Errors
///
/// Returns [`CpiError::Validation`] when the result is outside 1 GiB to
/// 16 TiB.
pub fn size_in_gib(size_mib: u64) -> Result<u64, CpiError> {
    let size_gib = size_mib.div_ceil(MIB_PER_GIB);
    if !(MIN_SIZE_GIB..=MAX_SIZE_GIB).contains(&size_gib) {
        return Err(CpiError::Validation(format!(
            "disk size must be between {MIN_SIZE_GIB} GiB and {MAX_SIZE_GIB} GiB, got {size_mib} MiB"
        )));
    }
    Ok(size_gib)
}

/// Lists the EBS-backed disks mapped on the instance.
#[must_use]
pub fn list_disks(instance: &Instance) -> Vec<DiskId> {
    instance
        .block_device_mappings
        .iter()
        .filter_map(|mapping| mapping.volume_id.clone())
        .collect()
}

/// Disk CRUD plus attach/detach bookkeeping.
#[derive(Debug)]
pub struct DiskManager<C, R> {
    cloud: Arc<C>,
    registry: Arc<R>,
    volumes: VolumeManager<C>,
    policies: WaitPolicies,
    fast_path_delete: bool,
    default_availability_zone: Option<String>,
}

impl<C, R> DiskManager<C, R>
where
    C: CloudApi,
    R: SettingsRegistry,
{
    /// Creates a manager over shared collaborators.
    #[must_use]
    pub fn new(cloud: Arc<C>, registry: Arc<R>, policies: WaitPolicies) -> Self {
        Self {
            volumes: VolumeManager::new(Arc::clone(&cloud), policies),
            cloud,
            registry,
            policies,
            fast_path_delete: false,
            default_availability_zone: None,
        }
    }

    /// Marks volumes for deletion instead of waiting for removal.
    #[must_use]
    pub const fn with_fast_path_delete(mut self, enabled: bool) -> Self {
        self.fast_path_delete = enabled;
        self
    }

    /// Zone used when a disk is created without an owning instance.
    #[must_use]
    pub fn with_default_availability_zone(mut self, zone: Option<String>) -> Self {
        self.default_availability_zone = zone;
        self
    }

    /// Creates a volume next to `owner` (or in the default zone) and waits
    /// until it is available.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] for bad sizes, properties or a
    /// missing zone, [`CpiError::Timeout`] when the volume never becomes
    /// available and [`CpiError::Cloud`] for remote failures.
    pub async fn create(
        &self,
        size_mib: u64,
        props: &DiskProperties,
        owner: Option<&Instance>,
    ) -> Result<DiskId, CpiError> {
        let size_gib = size_in_gib(size_mib)?;
        props.validate()?;
        let availability_zone = owner
            .map(|instance| instance.availability_zone.clone())
            .or_else(|| self.default_availability_zone.clone())
            .ok_or_else(|| {
                CpiError::Validation(String::from(
                    "no availability zone: pass an owning VM or set default_availability_zone",
                ))
            })?;

        let request = CreateVolumeRequest {
            availability_zone,
            size_gib,
            volume_type: props.volume_type.clone(),
            iops: props.iops,
            encrypted: props.encrypted,
            kms_key_arn: props.kms_key_arn.clone(),
        };
        let volume = self
            .cloud
            .create_volume(&request)
            .await
            .map_err(|err| cloud_failure("create volume", &request.availability_zone, &err))?;
        let disk_id = volume.id;

        let cloud = &self.cloud;
        let target = &disk_id;
        wait_for(
            &self.policies.resource,
            disk_id.as_str(),
            "available",
            |_| async move {
                match cloud.describe_volume(target).await {
                    Ok(volume) if volume.state == VolumeState::Available => Poll::Ready(()),
                    Ok(_) | Err(CloudApiError::VolumeNotFound { .. }) => Poll::NotReady,
                    Err(err) => Poll::Failed(cloud_failure("describe volume", target, &err)),
                }
            },
        )
        .await?;
        info!(disk_id = %disk_id, size_gib, "volume created");
        Ok(disk_id)
    }

    /// Deletes a volume, retrying while it is still in use.
    ///
    /// With fast-path deletion the volume is tagged for deletion and the
    /// call returns without confirming removal.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::DiskNotFound`] when the volume is already gone,
    /// [`CpiError::Timeout`] when it never disappears and
    /// [`CpiError::Cloud`] for remote failures, including a volume that stays
    /// in use for the whole retry budget.
    pub async fn delete(&self, disk_id: &DiskId) -> Result<(), CpiError> {
        let cloud = &self.cloud;
        wait_for(&self.policies.retry, disk_id.as_str(), "deletion accepted", |_| async move {
            match cloud.delete_volume(disk_id).await {
                Ok(()) => Poll::Ready(()),
                Err(err @ CloudApiError::VolumeInUse { .. }) => {
                    Poll::Retry(cloud_failure("delete volume", disk_id, &err))
                }
                Err(CloudApiError::VolumeNotFound { .. }) => Poll::Failed(CpiError::DiskNotFound {
                    disk_id: disk_id.to_string(),
                }),
                Err(err) => Poll::Failed(cloud_failure("delete volume", disk_id, &err)),
            }
        })
        .await?;

        if self.fast_path_delete {
            self.mark_for_deletion(disk_id).await;
            return Ok(());
        }

        wait_for(
            &self.policies.resource,
            disk_id.as_str(),
            "deleted",
            |_| async move {
                match cloud.describe_volume(disk_id).await {
                    Ok(volume) if volume.state == VolumeState::Deleted => Poll::Ready(()),
                    Err(CloudApiError::VolumeNotFound { .. }) => Poll::Ready(()),
                    Ok(_) => Poll::NotReady,
                    Err(err) => Poll::Failed(cloud_failure("describe volume", disk_id, &err)),
                }
            },
        )
        .await?;
        info!(disk_id = %disk_id, "volume deleted");
        Ok(())
    }

    async fn mark_for_deletion(&self, disk_id: &DiskId) {
        let marker = [(
            String::from(DELETE_MARKER_KEY),
            String::from(DELETE_MARKER_VALUE),
        )];
        match self.cloud.create_tags(disk_id, &marker).await {
            Ok(()) => info!(disk_id = %disk_id, "volume marked for deletion"),
            Err(CloudApiError::VolumeNotFound { .. }) => {
                info!(disk_id = %disk_id, "volume already removed");
            }
            Err(err) => warn!(disk_id = %disk_id, error = %err, "failed to mark volume for deletion"),
        }
    }

    /// Attaches the disk and records its device in the instance's settings.
    ///
    /// # Errors
    ///
    /// Propagates attach failures and returns [`CpiError::Registry`] when
    /// the record cannot be updated.
    pub async fn attach(&self, instance: &Instance, disk_id: &DiskId) -> Result<String, CpiError> {
        let device = self.volumes.attach(instance, disk_id).await?;
        update_settings(self.registry.as_ref(), &instance.id, |settings| {
            settings.insert_persistent_disk(disk_id, &device);
        })?;
        Ok(device)
    }

    /// Detaches the disk and forgets it in the instance's settings. A disk
    /// that no longer exists is only forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::DiskNotAttached`] when the disk exists but is not
    /// mapped on the instance, and propagates other detach and registry
    /// failures.
    pub async fn detach(&self, instance: &Instance, disk_id: &DiskId) -> Result<(), CpiError> {
        if self.has_disk(disk_id).await? {
            self.volumes.detach(instance, disk_id, false).await?;
        } else {
            warn!(disk_id = %disk_id, instance_id = %instance.id, "disk not found; skipping detach");
        }
        update_settings(self.registry.as_ref(), &instance.id, |settings| {
            settings.remove_persistent_disk(disk_id);
        })?;
        Ok(())
    }

    /// Reports whether the volume still exists.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Cloud`] when the lookup fails for another reason.
    pub async fn has_disk(&self, disk_id: &DiskId) -> Result<bool, CpiError> {
        match self.cloud.describe_volume(disk_id).await {
            Ok(_) => Ok(true),
            Err(CloudApiError::VolumeNotFound { .. }) => Ok(false),
            Err(err) => Err(cloud_failure("describe volume", disk_id, &err)),
        }
    }

    /// Pushes tags onto the volume. Hitting the tag limit is logged and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::DiskNotFound`] when the volume is gone and
    /// [`CpiError::Cloud`] for other failures.
    pub async fn set_metadata(
        &self,
        disk_id: &DiskId,
        metadata: &[(String, String)],
    ) -> Result<(), CpiError> {
        match self.cloud.create_tags(disk_id, metadata).await {
            Ok(()) => Ok(()),
            Err(err @ CloudApiError::TagLimitExceeded { .. }) => {
                warn!(disk_id = %disk_id, error = %err, "tag limit exceeded; metadata not applied");
                Ok(())
            }
            Err(CloudApiError::VolumeNotFound { .. }) => Err(CpiError::DiskNotFound {
                disk_id: disk_id.to_string(),
            }),
            Err(err) => Err(cloud_failure("tag volume", disk_id, &err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 1)]
    #[case(1024, 1)]
    #[case(1025, 2)]
    #[case(16 * 1024 * 1024, 16 * 1024)]
    fn sizes_round_up_to_whole_gib(#[case] size_mib: u64, #[case] expected: u64) {
        let size_gib = size_in_gib(size_mib).unwrap_or_else(|err| panic!("size: {err}"));
        assert_eq!(size_gib, expected);
    }

    #[rstest]
    #[case(0)]
    #[case(16 * 1024 * 1024 + 1)]
    fn sizes_outside_limits_are_rejected(#[case] size_mib: u64) {
        assert!(matches!(size_in_gib(size_mib), Err(CpiError::Validation(_))));
    }

    #[test]
    fn provisioned_iops_types_need_iops() {
        let props = DiskProperties {
            volume_type: String::from("io2"),
            ..DiskProperties::default()
        };
        assert!(props.validate().is_err());
        let with_iops = DiskProperties {
            iops: Some(3000),
            ..props
        };
        assert!(with_iops.validate().is_ok());
    }

    #[test]
    fn properties_deserialise_with_defaults() {
        let props: DiskProperties = serde_json::from_str(r#"{"encrypted": true}"#)
            .unwrap_or_else(|err| panic!("props: {err}"));
        assert_eq!(props.volume_type, "gp3");
        assert!(props.encrypted);
    }
}
