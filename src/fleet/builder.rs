//! Pure translation from instance parameters to a fleet pool specification.

use std::collections::BTreeMap;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::CpiError;

use super::types::{
    AvailabilityZone, BlockDeviceSpec, Capacity, Compute, GroupSpec, IamRole, InstanceTypes,
    LaunchSpecification, NetworkInterface, Orientation, Persistence, Strategy, Tag, Tenancy,
};

/// Tag injected into every pool.
pub const CLUSTER_TAG_KEY: &str = "cluster";
/// Value of the injected cluster tag.
pub const CLUSTER_TAG_VALUE: &str = "bosh";
/// Longest tag key the fleet API accepts, in characters.
pub const MAX_TAG_KEY_LEN: usize = 127;
/// Longest tag value the fleet API accepts, in characters.
pub const MAX_TAG_VALUE_LEN: usize = 255;

const GROUP_NAME_PREFIX: &str = "bosh/";
const GROUP_NAME_FRAGMENT_LEN: usize = 8;
const PRODUCT: &str = "Linux/UNIX";
const MAX_RISK: u8 = 100;

/// Caller supplied tag entry; entries missing either side are dropped.
pub type TagEntry = (Option<String>, Option<String>);

/// Validated parameters for one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceParams {
    /// Machine image.
    pub image_id: String,
    /// Comma-separated candidate instance types.
    pub instance_type: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Subnet inside the zone.
    pub subnet_id: String,
    /// Static private IP, for manual networks.
    pub private_ip: Option<String>,
    /// Associate an ephemeral public IP with the primary interface.
    pub associate_public_ip: bool,
    /// Key pair.
    pub key_name: Option<String>,
    /// Agent bootstrap payload.
    pub user_data: Option<String>,
    /// Security groups.
    pub security_groups: Vec<String>,
    /// Instance profile.
    pub iam_instance_profile: Option<String>,
    /// Block device mappings.
    pub block_devices: Vec<BlockDeviceSpec>,
    /// Tags applied to the instance.
    pub tags: Vec<TagEntry>,
    /// Free-form pool description.
    pub description: String,
}

impl InstanceParams {
    /// Starts a builder for [`InstanceParams`].
    #[must_use]
    pub fn builder() -> InstanceParamsBuilder {
        InstanceParamsBuilder::default()
    }

    /// Rejects parameters missing a required field.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] naming the first empty field.
    pub fn validate(&self) -> Result<(), CpiError> {
        for (field, value) in [
            ("image_id", &self.image_id),
            ("instance_type", &self.instance_type),
            ("availability_zone", &self.availability_zone),
            ("subnet_id", &self.subnet_id),
        ] {
            if value.is_empty() {
                return Err(CpiError::Validation(format!("missing {field}")));
            }
        }
        Ok(())
    }
}

/// Builder for [`InstanceParams`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceParamsBuilder {
    image_id: String,
    instance_type: String,
    availability_zone: String,
    subnet_id: String,
    private_ip: Option<String>,
    associate_public_ip: bool,
    key_name: Option<String>,
    user_data: Option<String>,
    security_groups: Vec<String>,
    iam_instance_profile: Option<String>,
    block_devices: Vec<BlockDeviceSpec>,
    tags: Vec<TagEntry>,
    description: Option<String>,
}

impl InstanceParamsBuilder {
    /// Sets the machine image.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.image_id = value.into();
        self
    }

    /// Sets the comma-separated instance types.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn availability_zone(mut self, value: impl Into<String>) -> Self {
        self.availability_zone = value.into();
        self
    }

    /// Sets the subnet.
    #[must_use]
    pub fn subnet_id(mut self, value: impl Into<String>) -> Self {
        self.subnet_id = value.into();
        self
    }

    /// Sets the static private IP.
    #[must_use]
    pub fn private_ip(mut self, value: Option<String>) -> Self {
        self.private_ip = value;
        self
    }

    /// Requests an ephemeral public IP.
    #[must_use]
    pub const fn associate_public_ip(mut self, value: bool) -> Self {
        self.associate_public_ip = value;
        self
    }

    /// Sets the key pair.
    #[must_use]
    pub fn key_name(mut self, value: Option<String>) -> Self {
        self.key_name = value;
        self
    }

    /// Sets the user data payload.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Sets the security groups.
    #[must_use]
    pub fn security_groups(mut self, value: Vec<String>) -> Self {
        self.security_groups = value;
        self
    }

    /// Sets the instance profile.
    #[must_use]
    pub fn iam_instance_profile(mut self, value: Option<String>) -> Self {
        self.iam_instance_profile = value;
        self
    }

    /// Adds a block device mapping.
    #[must_use]
    pub fn block_device(mut self, value: BlockDeviceSpec) -> Self {
        self.block_devices.push(value);
        self
    }

    /// Adds tag entries.
    #[must_use]
    pub fn tags(mut self, entries: impl IntoIterator<Item = TagEntry>) -> Self {
        self.tags.extend(entries);
        self
    }

    /// Sets the pool description.
    #[must_use]
    pub fn description(mut self, value: impl Into<String>) -> Self {
        self.description = Some(value.into());
        self
    }

    /// Builds and validates the [`InstanceParams`].
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] when image, instance type, zone or
    /// subnet is empty.
    pub fn build(self) -> Result<InstanceParams, CpiError> {
        let params = InstanceParams {
            image_id: self.image_id.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            availability_zone: self.availability_zone.trim().to_owned(),
            subnet_id: self.subnet_id.trim().to_owned(),
            private_ip: trimmed(self.private_ip),
            associate_public_ip: self.associate_public_ip,
            key_name: trimmed(self.key_name),
            user_data: self.user_data,
            security_groups: self
                .security_groups
                .into_iter()
                .map(|group| group.trim().to_owned())
                .filter(|group| !group.is_empty())
                .collect(),
            iam_instance_profile: trimmed(self.iam_instance_profile),
            block_devices: self.block_devices,
            tags: self.tags,
            description: self
                .description
                .unwrap_or_else(|| String::from("bosh managed vm")),
        };
        params.validate()?;
        Ok(params)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|raw| !raw.is_empty())
}

/// Advertised route that must point at the instance once it runs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AdvertisedRoute {
    /// Routing table identifier.
    pub table_id: String,
    /// Destination CIDR.
    pub destination: String,
}

/// Fleet-specific VM type properties.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct VmTypeProperties {
    /// Percentage of capacity on spot, 0 to 100.
    pub risk: u8,
    /// Fall back to on-demand when spot capacity is unavailable.
    pub fallback_to_od: bool,
    /// Spot market orientation.
    pub orientation: Orientation,
    /// Run on dedicated hardware.
    pub dedicated: bool,
    /// Keep source/destination checking on; NAT and router roles disable it.
    pub source_dest_check: bool,
    /// Classic load balancers to register.
    pub elbs: Vec<String>,
    /// Target groups to register; accepted but not yet sent to the API.
    pub target_groups: Vec<String>,
    /// Routes to repoint at the instance.
    pub advertised_routes: Vec<AdvertisedRoute>,
}

impl Default for VmTypeProperties {
    fn default() -> Self {
        Self {
            risk: MAX_RISK,
            fallback_to_od: true,
            orientation: Orientation::default(),
            dedicated: false,
            source_dest_check: true,
            elbs: Vec::new(),
            target_groups: Vec::new(),
            advertised_routes: Vec::new(),
        }
    }
}

impl VmTypeProperties {
    /// Rejects out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] when `risk` exceeds 100.
    pub fn validate(&self) -> Result<(), CpiError> {
        if self.risk > MAX_RISK {
            return Err(CpiError::Validation(format!(
                "risk must be between 0 and {MAX_RISK}, got {}",
                self.risk
            )));
        }
        Ok(())
    }
}

/// Builds a pool specification with a freshly generated name.
///
/// # Errors
///
/// Returns [`CpiError::Validation`] when the inputs are invalid.
pub fn build(params: &InstanceParams, props: &VmTypeProperties) -> Result<GroupSpec, CpiError> {
    build_named(params, props, generate_group_name())
}

/// Builds a pool specification under an explicit name.
///
/// # Errors
///
/// Returns [`CpiError::Validation`] when the inputs are invalid.
pub fn build_named(
    params: &InstanceParams,
    props: &VmTypeProperties,
    name: String,
) -> Result<GroupSpec, CpiError> {
    params.validate()?;
    props.validate()?;
    let spot = props.risk > 0;

    let network_interfaces = (!spot).then(|| {
        vec![NetworkInterface {
            device_index: 0,
            private_ip_address: params.private_ip.clone(),
            associate_public_ip_address: params.associate_public_ip,
            delete_on_termination: true,
        }]
    });
    let private_ips = if spot {
        params.private_ip.clone().map(|ip| vec![ip])
    } else {
        None
    };

    Ok(GroupSpec {
        name,
        description: params.description.clone(),
        capacity: Capacity::single_instance(),
        strategy: Strategy {
            risk: props.risk,
            fallback_to_od: props.fallback_to_od,
            availability_vs_cost: props.orientation,
            persistence: spot.then(Persistence::reattach),
        },
        compute: Compute {
            instance_types: instance_types(&params.instance_type)?,
            availability_zones: vec![AvailabilityZone {
                name: params.availability_zone.clone(),
                subnet_id: params.subnet_id.clone(),
            }],
            product: String::from(PRODUCT),
            private_ips,
            elastic_ips: None,
            launch_specification: LaunchSpecification {
                image_id: params.image_id.clone(),
                key_pair: params.key_name.clone(),
                user_data: params.user_data.as_deref().map(strip_newlines),
                tenancy: Tenancy::from_dedicated(props.dedicated),
                security_group_ids: params.security_groups.clone(),
                iam_role: params
                    .iam_instance_profile
                    .clone()
                    .map(|name| IamRole { name }),
                block_device_mappings: params.block_devices.clone(),
                network_interfaces,
                tags: format_tags(&params.tags),
                load_balancers_config: None,
            },
        },
    })
}

/// Generates a pool name of the form `bosh/<8 hex digits>`.
#[must_use]
pub fn generate_group_name() -> String {
    let fragment: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(GROUP_NAME_FRAGMENT_LEN)
        .collect();
    format!("{GROUP_NAME_PREFIX}{fragment}")
}

/// Splits a comma-separated instance type list. The first entry is the
/// on-demand fallback; every entry is offered to the spot allocator.
///
/// # Errors
///
/// Returns [`CpiError::Validation`] when no type remains after trimming.
pub fn instance_types(raw: &str) -> Result<InstanceTypes, CpiError> {
    let spot: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(str::to_owned)
        .collect();
    let ondemand = spot
        .first()
        .cloned()
        .ok_or_else(|| CpiError::Validation(String::from("missing instance_type")))?;
    Ok(InstanceTypes { ondemand, spot })
}

/// Formats tags for transmission: drops entries missing a key or value,
/// truncates keys and values, then injects the cluster tag. The result is
/// sorted by key with later duplicates winning.
#[must_use]
pub fn format_tags(entries: &[TagEntry]) -> Vec<Tag> {
    let mut tags: BTreeMap<String, String> = entries
        .iter()
        .filter_map(|entry| match entry {
            (Some(key), Some(value)) => Some((
                truncate(key, MAX_TAG_KEY_LEN),
                truncate(value, MAX_TAG_VALUE_LEN),
            )),
            _ => None,
        })
        .collect();
    tags.insert(
        String::from(CLUSTER_TAG_KEY),
        String::from(CLUSTER_TAG_VALUE),
    );
    tags.into_iter()
        .map(|(tag_key, tag_value)| Tag { tag_key, tag_value })
        .collect()
}

/// Removes embedded newlines; the fleet API requires single-line payloads.
#[must_use]
pub fn strip_newlines(raw: &str) -> String {
    raw.chars().filter(|ch| !matches!(ch, '\n' | '\r')).collect()
}

fn truncate(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}
