//! Wire model for the fleet API.
//!
//! Field names follow the fleet API's camelCase JSON. Optional blocks are
//! omitted from the payload rather than sent as `null`, because the API
//! distinguishes "absent" from "cleared".

use serde::{Deserialize, Serialize};

/// Pool sizing; always one instance for this crate.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Capacity {
    /// Desired instance count.
    pub target: u32,
    /// Lower bound.
    pub minimum: u32,
    /// Upper bound.
    pub maximum: u32,
    /// Capacity unit.
    pub unit: String,
}

impl Capacity {
    /// Capacity pinned to exactly one instance.
    #[must_use]
    pub fn single_instance() -> Self {
        Self {
            target: 1,
            minimum: 1,
            maximum: 1,
            unit: String::from("instance"),
        }
    }
}

/// Spot allocation orientation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Orientation {
    /// Cheapest markets first.
    #[serde(rename = "costOriented")]
    Cost,
    /// Most available markets first.
    #[serde(rename = "availabilityOriented")]
    Availability,
    /// Spread evenly across zones.
    #[serde(rename = "equalAzDistribution")]
    EqualDistribution,
    /// Balance cost and availability.
    #[default]
    #[serde(rename = "balanced")]
    Balanced,
}

/// Stateful persistence so a replacement instance resumes the same identity.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    /// Carry data volumes over to the replacement.
    pub should_persist_block_devices: bool,
    /// Carry the root volume over to the replacement.
    pub should_persist_root_device: bool,
    /// Keep the private IP for the replacement.
    pub should_persist_private_ip: bool,
    /// How block devices are carried over.
    pub block_devices_mode: String,
}

impl Persistence {
    /// Reattach volumes, keep the root device and the private IP.
    #[must_use]
    pub fn reattach() -> Self {
        Self {
            should_persist_block_devices: true,
            should_persist_root_device: true,
            should_persist_private_ip: true,
            block_devices_mode: String::from("reattach"),
        }
    }
}

/// Spot/on-demand strategy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Percentage of capacity on spot, 0 to 100.
    pub risk: u8,
    /// Fall back to on-demand when no spot capacity exists.
    pub fallback_to_od: bool,
    /// Spot market orientation.
    pub availability_vs_cost: Orientation,
    /// Present if and only if `risk > 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence: Option<Persistence>,
}

/// Candidate instance types.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceTypes {
    /// On-demand fallback type.
    pub ondemand: String,
    /// Types offered to the spot allocator.
    pub spot: Vec<String>,
}

/// Zone and subnet placement.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityZone {
    /// Zone name.
    pub name: String,
    /// Subnet inside the zone.
    pub subnet_id: String,
}

/// Instance tenancy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tenancy {
    /// Shared hardware.
    #[default]
    Default,
    /// Dedicated hardware.
    Dedicated,
}

impl Tenancy {
    /// Maps a dedicated flag onto the fleet API enum.
    #[must_use]
    pub const fn from_dedicated(dedicated: bool) -> Self {
        if dedicated {
            Self::Dedicated
        } else {
            Self::Default
        }
    }
}

/// EBS settings for a block device mapping.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EbsSpec {
    /// Size in GiB.
    pub volume_size: u64,
    /// Volume type.
    pub volume_type: String,
    /// Delete with the instance.
    pub delete_on_termination: bool,
    /// Provisioned IOPS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
}

/// Block device mapping in the launch specification.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Device name.
    pub device_name: String,
    /// EBS settings, absent for instance-store devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ebs: Option<EbsSpec>,
    /// Instance-store virtual name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,
}

/// Explicit network interface placement, used only when `risk == 0`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Interface index.
    pub device_index: u32,
    /// Static private IP, when the network assigns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,
    /// Associate an ephemeral public IP.
    pub associate_public_ip_address: bool,
    /// Delete with the instance.
    pub delete_on_termination: bool,
}

/// Resource tag.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Tag key.
    pub tag_key: String,
    /// Tag value.
    pub tag_value: String,
}

/// Load balancer registration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LoadBalancer {
    /// Load balancer name.
    pub name: String,
    /// Load balancer kind, `CLASSIC` for ELBs.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Load balancers attached to the pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancersConfig {
    /// Registered load balancers.
    pub load_balancers: Vec<LoadBalancer>,
}

/// Instance launch specification.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpecification {
    /// Machine image.
    pub image_id: String,
    /// Key pair name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<String>,
    /// Single-line user data payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Tenancy.
    pub tenancy: Tenancy,
    /// Security group identifiers or names.
    pub security_group_ids: Vec<String>,
    /// Instance profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iam_role: Option<IamRole>,
    /// Block device mappings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub block_device_mappings: Vec<BlockDeviceSpec>,
    /// Present if and only if `risk == 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_interfaces: Option<Vec<NetworkInterface>>,
    /// Tags applied to launched instances.
    pub tags: Vec<Tag>,
    /// Classic load balancers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancers_config: Option<LoadBalancersConfig>,
}

/// Instance profile reference.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IamRole {
    /// Profile name.
    pub name: String,
}

/// Compute section of a pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Compute {
    /// Candidate instance types.
    pub instance_types: InstanceTypes,
    /// Zone and subnet placement.
    pub availability_zones: Vec<AvailabilityZone>,
    /// Operating system product.
    pub product: String,
    /// Reserved private IPs; present if and only if `risk > 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ips: Option<Vec<String>>,
    /// Elastic IP allocation identifiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elastic_ips: Option<Vec<String>>,
    /// Launch specification.
    pub launch_specification: LaunchSpecification,
}

/// Full pool specification submitted on creation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupSpec {
    /// Generated pool name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Sizing.
    pub capacity: Capacity,
    /// Spot strategy.
    pub strategy: Strategy,
    /// Compute section.
    pub compute: Compute,
}

/// Sparse launch specification update.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpecificationUpdate {
    /// Replacement tag set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
    /// Replacement load balancer set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancers_config: Option<LoadBalancersConfig>,
}

/// Sparse compute update.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeUpdate {
    /// Replacement elastic IP allocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elastic_ips: Option<Vec<String>>,
    /// Launch specification changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_specification: Option<LaunchSpecificationUpdate>,
}

/// Sparse pool update; only populated fields are sent.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupUpdate {
    /// New pool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Compute changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeUpdate>,
}

/// Reclaim stateful resources when the pool is deleted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulDeallocation {
    /// Delete persisted volumes.
    pub should_delete_volumes: bool,
    /// Delete persisted network interfaces.
    pub should_delete_network_interfaces: bool,
    /// Delete persisted images.
    pub should_delete_images: bool,
    /// Delete persisted snapshots.
    pub should_delete_snapshots: bool,
}

/// Options sent with a pool deletion.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    /// Stateful resources to reclaim.
    pub stateful_deallocation: StatefulDeallocation,
}

impl DeleteOptions {
    /// Reclaim every resource the pool persisted.
    #[must_use]
    pub const fn reclaim_all() -> Self {
        Self {
            stateful_deallocation: StatefulDeallocation {
                should_delete_volumes: true,
                should_delete_network_interfaces: true,
                should_delete_images: true,
                should_delete_snapshots: true,
            },
        }
    }
}

/// Pool as returned by the fleet API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupRecord {
    /// Pool identifier.
    pub id: String,
    /// Pool name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Member reported by the pool status endpoint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    /// Backing compute instance, once launched.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Fulfilment status.
    #[serde(default)]
    pub status: Option<String>,
    /// Zone the member runs in.
    #[serde(default)]
    pub availability_zone: Option<String>,
}

/// Instance as known to the fleet API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetInstance {
    /// Compute instance identifier.
    pub instance_id: String,
    /// Pool owning the instance.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Lifecycle reported by the fleet API.
    #[serde(default)]
    pub lifecycle: Option<String>,
}

/// Response envelope shared by every fleet API endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct Envelope<T> {
    /// Response body.
    pub response: ResponseBody<T>,
}

/// Body of a response envelope.
#[derive(Clone, Debug, Deserialize)]
pub struct ResponseBody<T> {
    /// Returned items.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    /// Structured errors.
    #[serde(default)]
    pub errors: Vec<ApiErrorItem>,
}

/// Structured error in a response envelope.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ApiErrorItem {
    /// Machine readable code.
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}
