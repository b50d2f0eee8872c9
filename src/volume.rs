//! Device allocation and the attach/detach protocol for block volumes.

use std::sync::Arc;

use tracing::info;

use crate::cloud::{AttachmentState, CloudApi, CloudApiError, Instance, Volume};
use crate::error::{CpiError, cloud_failure};
use crate::types::{DiskId, InstanceId};
use crate::wait::{Poll, WaitPolicies, wait_for};

/// Device names offered to attached volumes, in allocation order.
pub const DEVICE_CANDIDATES: [&str; 11] = [
    "/dev/sdf", "/dev/sdg", "/dev/sdh", "/dev/sdi", "/dev/sdj", "/dev/sdk", "/dev/sdl", "/dev/sdm",
    "/dev/sdn", "/dev/sdo", "/dev/sdp",
];

const SD_PREFIX: &str = "/dev/sd";
const XVD_PREFIX: &str = "/dev/xvd";

/// Picks the first candidate device not already mapped on the instance.
/// Kernels may report `/dev/sdX` as `/dev/xvdX`; either form counts as taken.
///
/// # Errors
///
/// Returns [`CpiError::TooManyDisks`] when every candidate is taken.
pub fn select_device_name(instance: &Instance) -> Result<&'static str, CpiError> {
    DEVICE_CANDIDATES
        .into_iter()
        .find(|candidate| {
            let normalised = candidate.replacen(SD_PREFIX, XVD_PREFIX, 1);
            !instance.block_device_mappings.iter().any(|mapping| {
                mapping.device_name == *candidate || mapping.device_name == normalised
            })
        })
        .ok_or_else(|| CpiError::TooManyDisks {
            instance_id: instance.id.to_string(),
        })
}

/// Attaches and detaches volumes, absorbing the cloud API's transient
/// busy and state errors.
#[derive(Debug)]
pub struct VolumeManager<C> {
    cloud: Arc<C>,
    policies: WaitPolicies,
}

impl<C> Clone for VolumeManager<C> {
    fn clone(&self) -> Self {
        Self {
            cloud: Arc::clone(&self.cloud),
            policies: self.policies,
        }
    }
}

impl<C: CloudApi> VolumeManager<C> {
    /// Creates a manager over a shared cloud API client.
    #[must_use]
    pub const fn new(cloud: Arc<C>, policies: WaitPolicies) -> Self {
        Self { cloud, policies }
    }

    /// Attaches `disk_id` under a freshly allocated device name and waits for
    /// the attachment to settle. Returns the device name the API reports.
    ///
    /// "Volume in use" is retried for the whole retry budget; "incorrect
    /// state" only within its short tier.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::TooManyDisks`] before any remote call when no
    /// device is free, [`CpiError::DiskNotFound`] when the volume is gone,
    /// [`CpiError::Timeout`] when the attachment never settles and
    /// [`CpiError::Cloud`] for other failures.
    pub async fn attach(&self, instance: &Instance, disk_id: &DiskId) -> Result<String, CpiError> {
        let device = select_device_name(instance)?;
        let cloud = &self.cloud;
        let retry = self.policies.retry;

        let requested = wait_for(&retry, disk_id.as_str(), "attach accepted", |attempt| async move {
            match cloud.attach_volume(&instance.id, disk_id, device).await {
                Ok(attachment) => Poll::Ready(attachment),
                Err(err @ CloudApiError::VolumeInUse { .. }) => {
                    Poll::Retry(cloud_failure("attach volume", disk_id, &err))
                }
                Err(err @ CloudApiError::IncorrectState { .. }) if retry.in_short_tier(attempt) => {
                    Poll::Retry(cloud_failure("attach volume", disk_id, &err))
                }
                Err(CloudApiError::VolumeNotFound { .. }) => Poll::Failed(disk_not_found(disk_id)),
                Err(err) => Poll::Failed(cloud_failure("attach volume", disk_id, &err)),
            }
        })
        .await?;

        let attached = wait_for(
            &self.policies.resource,
            disk_id.as_str(),
            "attached",
            |_| async move {
                match cloud.describe_volume(disk_id).await {
                    Ok(volume) => attachment_device(&volume, &instance.id, AttachmentState::Attached)
                        .map_or(Poll::NotReady, Poll::Ready),
                    Err(CloudApiError::VolumeNotFound { .. }) => Poll::Failed(disk_not_found(disk_id)),
                    Err(err) => Poll::Failed(cloud_failure("describe volume", disk_id, &err)),
                }
            },
        )
        .await?;

        let device_name = if attached.is_empty() {
            requested.device
        } else {
            attached
        };
        info!(disk_id = %disk_id, instance_id = %instance.id, device = %device_name, "volume attached");
        Ok(device_name)
    }

    /// Detaches `disk_id` from the instance and waits until it is released.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::DiskNotAttached`] when the instance has no mapping
    /// for the volume, [`CpiError::Timeout`] when the detachment never
    /// settles and [`CpiError::Cloud`] for other failures.
    pub async fn detach(
        &self,
        instance: &Instance,
        disk_id: &DiskId,
        force: bool,
    ) -> Result<(), CpiError> {
        let mapping = instance
            .block_device_mappings
            .iter()
            .find(|mapping| mapping.volume_id.as_ref() == Some(disk_id))
            .ok_or_else(|| CpiError::DiskNotAttached {
                disk_id: disk_id.to_string(),
                instance_id: instance.id.to_string(),
            })?;

        match self
            .cloud
            .detach_volume(&instance.id, disk_id, &mapping.device_name, force)
            .await
        {
            Ok(_) => {}
            Err(CloudApiError::VolumeNotFound { .. }) => {
                info!(disk_id = %disk_id, "volume already gone; nothing to detach");
                return Ok(());
            }
            Err(err) => return Err(cloud_failure("detach volume", disk_id, &err)),
        }

        let cloud = &self.cloud;
        wait_for(
            &self.policies.resource,
            disk_id.as_str(),
            "detached",
            |_| async move {
                match cloud.describe_volume(disk_id).await {
                    Ok(volume) if still_attached(&volume, &instance.id) => Poll::NotReady,
                    Ok(_) | Err(CloudApiError::VolumeNotFound { .. }) => Poll::Ready(()),
                    Err(err) => Poll::Failed(cloud_failure("describe volume", disk_id, &err)),
                }
            },
        )
        .await?;
        info!(disk_id = %disk_id, instance_id = %instance.id, "volume detached");
        Ok(())
    }
}

fn disk_not_found(disk_id: &DiskId) -> CpiError {
    CpiError::DiskNotFound {
        disk_id: disk_id.to_string(),
    }
}

fn attachment_device(
    volume: &Volume,
    instance_id: &InstanceId,
    state: AttachmentState,
) -> Option<String> {
    volume
        .attachments
        .iter()
        .find(|attachment| attachment.instance_id == *instance_id && attachment.state == state)
        .map(|attachment| attachment.device.clone())
}

fn still_attached(volume: &Volume, instance_id: &InstanceId) -> bool {
    volume.attachments.iter().any(|attachment| {
        attachment.instance_id == *instance_id && attachment.state != AttachmentState::Detached
    })
}
