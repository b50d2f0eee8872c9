//! VM creation, rollback and deletion against scripted fleet and cloud APIs.

#[path = "common/test_constants.rs"]
mod test_constants;

#[path = "common/harness.rs"]
mod common_harness;

use fleet_cpi::fleet::builder::AdvertisedRoute;
use fleet_cpi::fleet::types::{Tag, Tenancy};
use fleet_cpi::test_support::{CloudOp, FleetOp, running_instance};
use fleet_cpi::{
    AgentSettings, CloudApiError, CpiError, FleetError, InstanceState, Network, NetworkKind,
    SettingsRegistry, VmId,
};
use rstest::{fixture, rstest};

use common_harness::{Harness, vm_request};
use test_constants::{AVAILABILITY_ZONE, IMAGE_ID};

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

fn with_instance(harness: &Harness, instance_id: &str) {
    harness.fleet.queue_instance(instance_id);
    harness
        .cloud
        .insert_instance(running_instance(instance_id, AVAILABILITY_ZONE));
}

fn seed_settings(harness: &Harness, key: &str) {
    let mut settings = AgentSettings::default();
    settings.insert_persistent_disk("vol-1", "/dev/sdf");
    harness
        .registry
        .write(key, &settings)
        .unwrap_or_else(|err| panic!("seed registry: {err}"));
}

#[rstest]
#[tokio::test]
async fn create_succeeds_when_pool_fulfils_on_last_attempt(harness: Harness) {
    with_instance(&harness, "i-1");
    harness.fleet.set_empty_status_polls(common_harness::ATTEMPTS - 1);

    let vm_id = harness
        .cpi
        .create_vm(&vm_request("agent-1"))
        .await
        .unwrap_or_else(|err| panic!("create vm: {err}"));

    assert_eq!(vm_id, VmId::from("sig-1"));
    assert_eq!(harness.fleet.status_calls(), common_harness::ATTEMPTS);
    let spec = harness
        .fleet
        .created()
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("pool spec should be submitted"));
    assert!(spec.name.starts_with("bosh/"), "unexpected name {}", spec.name);
    assert_eq!(spec.description, "bosh vm agent-1");
    assert_eq!(spec.compute.launch_specification.image_id, IMAGE_ID);
    assert_eq!(spec.compute.launch_specification.tenancy, Tenancy::Default);
    assert!(spec.compute.launch_specification.tags.contains(&Tag {
        tag_key: String::from("agent_id"),
        tag_value: String::from("agent-1"),
    }));
    assert!(
        harness
            .cpi
            .has_vm(&vm_id)
            .await
            .unwrap_or_else(|err| panic!("has vm: {err}"))
    );
}

#[rstest]
#[tokio::test]
async fn create_times_out_when_pool_never_fulfils(harness: Harness) {
    with_instance(&harness, "i-1");
    harness.fleet.set_empty_status_polls(common_harness::ATTEMPTS + 1);

    let err = harness
        .cpi
        .create_vm(&vm_request("agent-1"))
        .await
        .expect_err("pool never reports an instance");

    assert_eq!(
        err,
        CpiError::Timeout {
            resource: String::from("sig-1"),
            desired: String::from("fulfilled"),
        }
    );
    assert_eq!(harness.fleet.status_calls(), common_harness::ATTEMPTS);
    assert!(harness.fleet.has_group("sig-1"), "pool is left in place");
}

#[rstest]
#[tokio::test]
async fn create_retries_after_abrupt_termination(harness: Harness) {
    with_instance(&harness, "i-1");
    with_instance(&harness, "i-2");
    harness
        .cloud
        .script_instance_states("i-1", [InstanceState::Pending, InstanceState::Terminated]);

    let vm_id = harness
        .cpi
        .create_vm(&vm_request("agent-1"))
        .await
        .unwrap_or_else(|err| panic!("second attempt should succeed: {err}"));

    assert_eq!(vm_id, VmId::from("sig-2"));
    assert_eq!(harness.fleet.created().len(), 2);
    assert_eq!(harness.fleet.deleted_ids(), vec![String::from("sig-1")]);
    assert!(!harness.fleet.has_group("sig-1"));
}

#[rstest]
#[tokio::test]
async fn create_gives_up_after_two_abrupt_retries(harness: Harness) {
    for instance_id in ["i-1", "i-2", "i-3"] {
        with_instance(&harness, instance_id);
        harness.cloud.script_instance_states(
            instance_id,
            [InstanceState::Pending, InstanceState::ShuttingDown],
        );
    }

    let err = harness
        .cpi
        .create_vm(&vm_request("agent-1"))
        .await
        .expect_err("every instance is terminated");

    assert_eq!(
        err,
        CpiError::AbruptlyTerminated {
            instance_id: String::from("i-3"),
        }
    );
    assert_eq!(harness.fleet.created().len(), 3);
    assert_eq!(harness.fleet.deleted_ids().len(), 3);
}

#[rstest]
#[tokio::test]
async fn failed_post_configuration_deletes_the_vm(harness: Harness) {
    with_instance(&harness, "i-1");
    harness.cloud.fail_next(
        CloudOp::ReplaceRoute,
        &CloudApiError::Other {
            code: String::from("InvalidRouteTableID.NotFound"),
            message: String::from("no such table"),
        },
    );
    let mut request = vm_request("agent-1");
    request.vm_type.fleet.advertised_routes = vec![AdvertisedRoute {
        table_id: String::from("rtb-1"),
        destination: String::from("10.0.0.0/16"),
    }];

    let err = harness
        .cpi
        .create_vm(&request)
        .await
        .expect_err("route update fails");

    let CpiError::Cloud { operation, .. } = err else {
        panic!("expected cloud error, got {err:?}");
    };
    assert_eq!(operation, "replace route");
    assert_eq!(harness.fleet.deleted_ids(), vec![String::from("sig-1")]);
    assert_eq!(harness.cloud.call_count(CloudOp::TerminateInstance), 0);
}

#[rstest]
#[tokio::test]
async fn rollback_failure_does_not_mask_the_original_error(harness: Harness) {
    with_instance(&harness, "i-1");
    harness.cloud.fail_next(
        CloudOp::ModifySourceDestCheck,
        &CloudApiError::Other {
            code: String::from("UnauthorizedOperation"),
            message: String::from("denied"),
        },
    );
    harness.fleet.fail_next(
        FleetOp::Delete,
        FleetError::Timeout {
            operation: String::from("DELETE /group/sig-1"),
        },
    );
    let mut request = vm_request("agent-1");
    request.vm_type.fleet.source_dest_check = false;

    let err = harness
        .cpi
        .create_vm(&request)
        .await
        .expect_err("source/dest update fails");

    let CpiError::Cloud {
        operation, message, ..
    } = err
    else {
        panic!("expected cloud error, got {err:?}");
    };
    assert_eq!(operation, "disable source/dest check");
    assert!(message.contains("denied"), "unexpected message {message}");
    assert!(harness.fleet.has_group("sig-1"));
}

#[rstest]
#[tokio::test]
async fn vip_network_pushes_its_allocation_id(harness: Harness) {
    with_instance(&harness, "i-1");
    harness.cloud.insert_address("54.1.2.3", "eipalloc-1");
    let mut request = vm_request("agent-1");
    request.networks.insert(
        String::from("public"),
        Network {
            kind: NetworkKind::Vip,
            ip: Some(String::from("54.1.2.3")),
            subnet_id: None,
            security_groups: Vec::new(),
        },
    );

    harness
        .cpi
        .create_vm(&request)
        .await
        .unwrap_or_else(|err| panic!("create vm: {err}"));

    let elastic_ips: Vec<_> = harness
        .fleet
        .updates()
        .into_iter()
        .filter_map(|(_, update)| update.compute.and_then(|compute| compute.elastic_ips))
        .collect();
    assert_eq!(elastic_ips, vec![vec![String::from("eipalloc-1")]]);
}

#[rstest]
#[tokio::test]
async fn two_vip_networks_are_rejected_and_rolled_back(harness: Harness) {
    with_instance(&harness, "i-1");
    let mut request = vm_request("agent-1");
    for (name, ip) in [("public-a", "54.1.2.3"), ("public-b", "54.1.2.4")] {
        request.networks.insert(
            String::from(name),
            Network {
                kind: NetworkKind::Vip,
                ip: Some(String::from(ip)),
                subnet_id: None,
                security_groups: Vec::new(),
            },
        );
    }

    let err = harness
        .cpi
        .create_vm(&request)
        .await
        .expect_err("only one vip network is allowed");

    assert!(matches!(err, CpiError::Validation(_)), "unexpected {err:?}");
    assert_eq!(harness.fleet.deleted_ids(), vec![String::from("sig-1")]);
}

#[rstest]
#[tokio::test]
async fn delete_without_instance_still_removes_pool_and_settings(harness: Harness) {
    harness.fleet.insert_group("sig-9", None);
    seed_settings(&harness, "sig-9");

    harness
        .cpi
        .delete_vm(&VmId::from("sig-9"))
        .await
        .unwrap_or_else(|err| panic!("delete vm: {err}"));

    assert_eq!(harness.fleet.deleted_ids(), vec![String::from("sig-9")]);
    assert!(harness.registry.keys().is_empty());
    assert_eq!(harness.cloud.call_count(CloudOp::TerminateInstance), 0);
}

#[rstest]
#[tokio::test]
async fn delete_waits_for_termination_and_erases_instance_settings(harness: Harness) {
    harness.fleet.insert_group("sig-2", Some("i-2"));
    harness
        .cloud
        .insert_instance(running_instance("i-2", AVAILABILITY_ZONE));
    harness.cloud.script_instance_states(
        "i-2",
        [
            InstanceState::Running,
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
        ],
    );
    seed_settings(&harness, "i-2");

    harness
        .cpi
        .delete_vm(&VmId::from("sig-2"))
        .await
        .unwrap_or_else(|err| panic!("delete vm: {err}"));

    assert!(harness.registry.keys().is_empty());
    let options = harness
        .fleet
        .delete_options()
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("delete should be requested"));
    assert!(options.stateful_deallocation.should_delete_volumes);
    assert_eq!(harness.cloud.call_count(CloudOp::DescribeInstance), 3);
}

#[rstest]
#[tokio::test]
async fn delete_terminates_instance_left_behind_by_an_absent_pool(harness: Harness) {
    harness.fleet.insert_orphaned_member("sig-7", "i-9");
    harness
        .cloud
        .insert_instance(running_instance("i-9", AVAILABILITY_ZONE));
    seed_settings(&harness, "i-9");

    harness
        .cpi
        .delete_vm(&VmId::from("sig-7"))
        .await
        .unwrap_or_else(|err| panic!("delete vm: {err}"));

    assert_eq!(harness.fleet.deleted_ids(), vec![String::from("sig-7")]);
    assert_eq!(harness.cloud.call_count(CloudOp::TerminateInstance), 1);
    let instance = harness
        .cloud
        .instance("i-9")
        .unwrap_or_else(|| panic!("instance should still be described"));
    assert_eq!(instance.state, InstanceState::Terminated);
    assert!(harness.registry.keys().is_empty());
}

#[rstest]
#[tokio::test]
async fn fast_delete_of_an_absent_pool_terminates_without_waiting() {
    let harness = Harness::with_fast_path(true);
    harness.fleet.insert_orphaned_member("sig-7", "i-9");
    harness
        .cloud
        .insert_instance(running_instance("i-9", AVAILABILITY_ZONE));

    harness
        .cpi
        .delete_vm(&VmId::from("sig-7"))
        .await
        .unwrap_or_else(|err| panic!("delete vm: {err}"));

    assert_eq!(harness.cloud.call_count(CloudOp::TerminateInstance), 1);
    assert_eq!(harness.cloud.call_count(CloudOp::DescribeInstance), 1);
}

#[rstest]
#[tokio::test]
async fn registry_cleanup_runs_when_deletion_fails(harness: Harness) {
    harness.fleet.insert_group("sig-4", None);
    seed_settings(&harness, "sig-4");
    harness.fleet.fail_next(
        FleetOp::Delete,
        FleetError::Timeout {
            operation: String::from("DELETE /group/sig-4"),
        },
    );

    let err = harness
        .cpi
        .delete_vm(&VmId::from("sig-4"))
        .await
        .expect_err("fleet delete times out");

    assert!(matches!(err, CpiError::Cloud { .. }), "unexpected {err:?}");
    assert!(harness.registry.keys().is_empty());
}

#[rstest]
#[tokio::test]
async fn deleting_an_unknown_pool_is_a_no_op(harness: Harness) {
    harness
        .cpi
        .delete_vm(&VmId::from("sig-missing"))
        .await
        .unwrap_or_else(|err| panic!("delete vm: {err}"));

    assert_eq!(harness.cloud.call_count(CloudOp::TerminateInstance), 0);
}

#[rstest]
#[tokio::test]
async fn metadata_renames_the_pool_and_replaces_its_tags(harness: Harness) {
    harness.fleet.insert_group("sig-3", Some("i-3"));

    harness
        .cpi
        .set_vm_metadata(
            &VmId::from("sig-3"),
            &[
                (Some(String::from("Name")), Some(String::from("web/0"))),
                (Some(String::from("job")), Some(String::from("web"))),
            ],
        )
        .await
        .unwrap_or_else(|err| panic!("set metadata: {err}"));

    let (group_id, update) = harness
        .fleet
        .updates()
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("update should be sent"));
    assert_eq!(group_id, "sig-3");
    assert_eq!(update.name.as_deref(), Some("web/0"));
    let tags = update
        .compute
        .and_then(|compute| compute.launch_specification)
        .and_then(|spec| spec.tags)
        .unwrap_or_default();
    assert!(tags.contains(&Tag {
        tag_key: String::from("cluster"),
        tag_value: String::from("bosh"),
    }));
    assert!(tags.contains(&Tag {
        tag_key: String::from("job"),
        tag_value: String::from("web"),
    }));
    assert_eq!(tags.len(), 3, "only caller metadata and the cluster tag: {tags:?}");
}
