//! Wires a [`Cpi`] over scripted collaborators for integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_cpi::test_support::{ScriptedCloud, ScriptedFleet, instant_policies};
use fleet_cpi::{
    Cpi, CpiOptions, InstanceDefaults, MemoryRegistry, Network, NetworkKind, VmCreateRequest,
    VmType, VmTypeProperties, WaitPolicies,
};

use super::test_constants::{AVAILABILITY_ZONE, IMAGE_ID, INSTANCE_TYPE, SUBNET_ID};

/// Attempts every wait gets in tests; matches the production pool budget.
pub const ATTEMPTS: u32 = 30;

/// Scripted collaborators plus the facade built over them.
pub struct Harness {
    pub cloud: ScriptedCloud,
    pub fleet: ScriptedFleet,
    pub registry: MemoryRegistry,
    pub cpi: Cpi<ScriptedFleet, ScriptedCloud, MemoryRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fast_path(false)
    }

    pub fn with_fast_path(fast_path_delete: bool) -> Self {
        Self::with_options(fast_path_delete, instant_policies(ATTEMPTS))
    }

    pub fn with_options(fast_path_delete: bool, policies: WaitPolicies) -> Self {
        let cloud = ScriptedCloud::new();
        let fleet = ScriptedFleet::new();
        let registry = MemoryRegistry::new();
        cloud.insert_subnet(SUBNET_ID, AVAILABILITY_ZONE);
        let options = CpiOptions {
            defaults: InstanceDefaults {
                key_name: Some(String::from("bosh")),
                security_groups: vec![String::from("sg-default")],
                ..InstanceDefaults::default()
            },
            fast_path_delete,
            policies,
        };
        let cpi = Cpi::new(
            Arc::new(fleet.clone()),
            Arc::new(cloud.clone()),
            Arc::new(registry.clone()),
            options,
        );
        Self {
            cloud,
            fleet,
            registry,
            cpi,
        }
    }
}

/// Minimal request for a VM on one dynamic network.
pub fn vm_request(agent_id: &str) -> VmCreateRequest {
    let mut networks = BTreeMap::new();
    networks.insert(
        String::from("default"),
        Network {
            kind: NetworkKind::Dynamic,
            ip: None,
            subnet_id: Some(String::from(SUBNET_ID)),
            security_groups: Vec::new(),
        },
    );
    VmCreateRequest {
        agent_id: agent_id.to_owned(),
        image_id: String::from(IMAGE_ID),
        vm_type: VmType {
            instance_type: String::from(INSTANCE_TYPE),
            key_name: None,
            availability_zone: None,
            security_groups: Vec::new(),
            iam_instance_profile: None,
            auto_assign_public_ip: false,
            ephemeral_disk: None,
            fleet: VmTypeProperties::default(),
        },
        networks,
        disk_locality: Vec::new(),
        user_data: Some(String::from("{\"agent\":\"settings\"}")),
        tags: Vec::new(),
    }
}
