//! Collaborator interface for the primary compute, network and storage API.
//!
//! The concrete SDK client lives outside this crate. Implementations map the
//! provider's named error conditions onto [`CloudApiError`] so the managers
//! can apply their retry and not-found policies.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::types::{DiskId, InstanceId};

/// Future returned by cloud API operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudApiError>> + Send + 'a>>;

/// Lifecycle state of a compute instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Instance is booting.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is stopping.
    Stopping,
    /// Instance is stopped.
    Stopped,
    /// Instance is being terminated.
    ShuttingDown,
    /// Instance is gone.
    Terminated,
}

impl InstanceState {
    /// Returns `true` once the instance is on its way out or already gone.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

/// Block device mapping reported for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDeviceMapping {
    /// Device name, for example `/dev/sdf` or `/dev/xvdf`.
    pub device_name: String,
    /// Backing EBS volume, absent for instance-store devices.
    pub volume_id: Option<DiskId>,
}

/// Snapshot of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider instance identifier.
    pub id: InstanceId,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Availability zone hosting the instance.
    pub availability_zone: String,
    /// Primary private IPv4 address.
    pub private_ip: Option<String>,
    /// Subnet of the primary interface.
    pub subnet_id: Option<String>,
    /// Current block device mappings.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

/// Lifecycle state of a volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Volume is being created.
    Creating,
    /// Volume is ready and detached.
    Available,
    /// Volume is attached to an instance.
    InUse,
    /// Volume is being deleted.
    Deleting,
    /// Volume is gone.
    Deleted,
}

/// Attachment state between a volume and an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachmentState {
    /// Attachment requested.
    Attaching,
    /// Volume visible to the instance.
    Attached,
    /// Detachment requested.
    Detaching,
    /// Volume released by the instance.
    Detached,
}

/// Relationship between one volume and one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Device name assigned by the provider.
    pub device: String,
    /// Instance holding the volume.
    pub instance_id: InstanceId,
    /// Volume being attached.
    pub volume_id: DiskId,
    /// Current attachment state.
    pub state: AttachmentState,
}

/// Snapshot of a block storage volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Volume identifier.
    pub id: DiskId,
    /// Current lifecycle state.
    pub state: VolumeState,
    /// Availability zone of the volume.
    pub availability_zone: String,
    /// Size in GiB.
    pub size_gib: u64,
    /// Current attachments; at most one for the volumes this crate manages.
    pub attachments: Vec<VolumeAttachment>,
}

/// Parameters for a new volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Target availability zone.
    pub availability_zone: String,
    /// Size in GiB.
    pub size_gib: u64,
    /// Volume type, for example `gp3` or `io1`.
    pub volume_type: String,
    /// Provisioned IOPS, when the type supports it.
    pub iops: Option<u32>,
    /// Whether the volume is encrypted at rest.
    pub encrypted: bool,
    /// Customer managed key used for encryption.
    pub kms_key_arn: Option<String>,
}

/// Subnet description.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subnet {
    /// Subnet identifier.
    pub id: String,
    /// Availability zone the subnet lives in.
    pub availability_zone: String,
}

/// Elastic address description, scoped to virtual-network addresses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Address {
    /// Public IPv4 address.
    pub public_ip: String,
    /// Allocation identifier used to associate the address.
    pub allocation_id: String,
}

/// Named error conditions raised by the cloud API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudApiError {
    /// The volume is still held by an instance.
    #[error("volume {volume_id} is in use")]
    VolumeInUse {
        /// Volume identifier.
        volume_id: String,
    },
    /// The resource is not in a state that allows the request.
    #[error("incorrect state: {message}")]
    IncorrectState {
        /// Provider message.
        message: String,
    },
    /// The volume does not exist.
    #[error("volume {volume_id} not found")]
    VolumeNotFound {
        /// Volume identifier.
        volume_id: String,
    },
    /// The instance does not exist.
    #[error("instance {instance_id} not found")]
    InstanceNotFound {
        /// Instance identifier.
        instance_id: String,
    },
    /// The resource already carries the maximum number of tags.
    #[error("tag limit exceeded for {resource_id}")]
    TagLimitExceeded {
        /// Resource being tagged.
        resource_id: String,
    },
    /// The remote call exceeded its transport deadline.
    #[error("request timed out during {operation}")]
    Timeout {
        /// Operation in flight.
        operation: String,
    },
    /// Any other provider failure.
    #[error("{code}: {message}")]
    Other {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },
}

/// Operations consumed from the cloud API.
pub trait CloudApi: Send + Sync {
    /// Describes an instance, returning `None` when it no longer exists.
    fn describe_instance<'a>(&'a self, id: &'a InstanceId) -> CloudFuture<'a, Option<Instance>>;

    /// Requests termination of an instance.
    fn terminate_instance<'a>(&'a self, id: &'a InstanceId) -> CloudFuture<'a, ()>;

    /// Enables or disables source/destination checking on an instance.
    fn modify_source_dest_check<'a>(
        &'a self,
        id: &'a InstanceId,
        enabled: bool,
    ) -> CloudFuture<'a, ()>;

    /// Points a route in a routing table at an instance.
    fn replace_route<'a>(
        &'a self,
        table_id: &'a str,
        destination: &'a str,
        instance_id: &'a InstanceId,
    ) -> CloudFuture<'a, ()>;

    /// Creates a volume.
    fn create_volume<'a>(&'a self, request: &'a CreateVolumeRequest) -> CloudFuture<'a, Volume>;

    /// Describes a volume; raises [`CloudApiError::VolumeNotFound`] when absent.
    fn describe_volume<'a>(&'a self, id: &'a DiskId) -> CloudFuture<'a, Volume>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, id: &'a DiskId) -> CloudFuture<'a, ()>;

    /// Adds or overwrites tags on a resource.
    fn create_tags<'a>(
        &'a self,
        resource_id: &'a str,
        tags: &'a [(String, String)],
    ) -> CloudFuture<'a, ()>;

    /// Attaches a volume to an instance under the given device name.
    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        volume_id: &'a DiskId,
        device: &'a str,
    ) -> CloudFuture<'a, VolumeAttachment>;

    /// Detaches a volume from an instance.
    fn detach_volume<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        volume_id: &'a DiskId,
        device: &'a str,
        force: bool,
    ) -> CloudFuture<'a, VolumeAttachment>;

    /// Describes a subnet.
    fn describe_subnet<'a>(&'a self, subnet_id: &'a str) -> CloudFuture<'a, Subnet>;

    /// Looks up a virtual-network elastic address by public IP.
    fn describe_address<'a>(&'a self, public_ip: &'a str) -> CloudFuture<'a, Option<Address>>;
}
