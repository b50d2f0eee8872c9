//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedCloud`] and [`ScriptedFleet`] keep simple in-memory models of the
//! two control planes. Failures and state transitions are queued up front so
//! every retry and wait path can be driven without real timing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::cloud::{
    Address, AttachmentState, BlockDeviceMapping, CloudApi, CloudApiError, CloudFuture,
    CreateVolumeRequest, Instance, InstanceState, Subnet, Volume, VolumeAttachment, VolumeState,
};
use crate::fleet::client::{FleetApi, FleetError, FleetFuture};
use crate::fleet::types::{
    DeleteOptions, FleetInstance, GroupMember, GroupRecord, GroupSpec, GroupUpdate,
};
use crate::types::{DiskId, InstanceId, VmId};
use crate::wait::{WaitPolicies, WaitPolicy};

/// Wait policies with zero intervals and `attempts` tries per wait.
#[must_use]
pub const fn instant_policies(attempts: u32) -> WaitPolicies {
    WaitPolicies::uniform(WaitPolicy::fixed(std::time::Duration::ZERO, attempts))
}

/// Like [`instant_policies`], but the retry policy keeps the production
/// attempt budget and short tier.
#[must_use]
pub const fn instant_production_retry(attempts: u32) -> WaitPolicies {
    WaitPolicies {
        retry: WaitPolicy::retry().without_delays(),
        ..instant_policies(attempts)
    }
}

/// Running instance with no block devices beyond the root volume.
#[must_use]
pub fn running_instance(id: &str, availability_zone: &str) -> Instance {
    Instance {
        id: InstanceId::from(id),
        state: InstanceState::Running,
        availability_zone: availability_zone.to_owned(),
        private_ip: Some(String::from("10.0.0.10")),
        subnet_id: Some(String::from("subnet-1")),
        block_device_mappings: vec![BlockDeviceMapping {
            device_name: String::from("/dev/xvda"),
            volume_id: Some(DiskId::from(format!("vol-root-{id}"))),
        }],
    }
}

/// Detached, available volume.
#[must_use]
pub fn available_volume(id: &str, availability_zone: &str) -> Volume {
    Volume {
        id: DiskId::from(id),
        state: VolumeState::Available,
        availability_zone: availability_zone.to_owned(),
        size_gib: 10,
        attachments: Vec::new(),
    }
}

/// Cloud API operations that can be scripted to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CloudOp {
    /// `describe_instance`.
    DescribeInstance,
    /// `terminate_instance`.
    TerminateInstance,
    /// `modify_source_dest_check`.
    ModifySourceDestCheck,
    /// `replace_route`.
    ReplaceRoute,
    /// `create_volume`.
    CreateVolume,
    /// `describe_volume`.
    DescribeVolume,
    /// `delete_volume`.
    DeleteVolume,
    /// `create_tags`.
    CreateTags,
    /// `attach_volume`.
    AttachVolume,
    /// `detach_volume`.
    DetachVolume,
    /// `describe_subnet`.
    DescribeSubnet,
    /// `describe_address`.
    DescribeAddress,
}

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<InstanceId, Instance>,
    instance_states: BTreeMap<InstanceId, VecDeque<InstanceState>>,
    volumes: BTreeMap<DiskId, Volume>,
    subnets: BTreeMap<String, Subnet>,
    addresses: BTreeMap<String, Address>,
    tags: BTreeMap<String, Vec<(String, String)>>,
    failures: BTreeMap<CloudOp, VecDeque<CloudApiError>>,
    calls: Vec<(CloudOp, String)>,
    created_volumes: u32,
}

impl CloudState {
    fn record(&mut self, op: CloudOp, target: &str) -> Result<(), CloudApiError> {
        self.calls.push((op, target.to_owned()));
        self.failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
            .map_or(Ok(()), Err)
    }
}

/// In-memory cloud API with scripted failures and state transitions.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl ScriptedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces an instance.
    pub fn insert_instance(&self, instance: Instance) {
        self.state().instances.insert(instance.id.clone(), instance);
    }

    /// Queues states the instance reports on successive describes; the last
    /// one sticks.
    pub fn script_instance_states(&self, id: &str, states: impl IntoIterator<Item = InstanceState>) {
        self.state()
            .instance_states
            .entry(InstanceId::from(id))
            .or_default()
            .extend(states);
    }

    /// Adds or replaces a volume.
    pub fn insert_volume(&self, volume: Volume) {
        self.state().volumes.insert(volume.id.clone(), volume);
    }

    /// Adds a subnet.
    pub fn insert_subnet(&self, id: &str, availability_zone: &str) {
        self.state().subnets.insert(
            id.to_owned(),
            Subnet {
                id: id.to_owned(),
                availability_zone: availability_zone.to_owned(),
            },
        );
    }

    /// Adds an elastic address.
    pub fn insert_address(&self, public_ip: &str, allocation_id: &str) {
        self.state().addresses.insert(
            public_ip.to_owned(),
            Address {
                public_ip: public_ip.to_owned(),
                allocation_id: allocation_id.to_owned(),
            },
        );
    }

    /// Makes the next `times` calls of `op` fail with `error`.
    pub fn fail_times(&self, op: CloudOp, error: &CloudApiError, times: usize) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .extend(std::iter::repeat_n(error.clone(), times));
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: CloudOp, error: &CloudApiError) {
        self.fail_times(op, error, 1);
    }

    /// Current view of an instance.
    #[must_use]
    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.state().instances.get(&InstanceId::from(id)).cloned()
    }

    /// Current view of a volume.
    #[must_use]
    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.state().volumes.get(&DiskId::from(id)).cloned()
    }

    /// Tags pushed onto a resource.
    #[must_use]
    pub fn tags_for(&self, resource_id: &str) -> Vec<(String, String)> {
        self.state()
            .tags
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every call made, in order, with its target.
    #[must_use]
    pub fn calls(&self) -> Vec<(CloudOp, String)> {
        self.state().calls.clone()
    }

    /// Number of calls made to `op`.
    #[must_use]
    pub fn call_count(&self, op: CloudOp) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(called, _)| *called == op)
            .count()
    }
}

fn respond<'a, T: Send + 'a>(result: Result<T, CloudApiError>) -> CloudFuture<'a, T> {
    Box::pin(ready(result))
}

impl CloudApi for ScriptedCloud {
    fn describe_instance<'a>(&'a self, id: &'a InstanceId) -> CloudFuture<'a, Option<Instance>> {
        let mut state = self.state();
        let result = state.record(CloudOp::DescribeInstance, id).map(|()| {
            let next = state
                .instance_states
                .get_mut(id)
                .and_then(VecDeque::pop_front);
            let instance = state.instances.get_mut(id)?;
            if let Some(next_state) = next {
                instance.state = next_state;
            }
            Some(instance.clone())
        });
        respond(result)
    }

    fn terminate_instance<'a>(&'a self, id: &'a InstanceId) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.record(CloudOp::TerminateInstance, id).and_then(|()| {
            let instance = state
                .instances
                .get_mut(id)
                .ok_or_else(|| CloudApiError::InstanceNotFound {
                    instance_id: id.to_string(),
                })?;
            instance.state = InstanceState::Terminated;
            Ok(())
        });
        respond(result)
    }

    fn modify_source_dest_check<'a>(
        &'a self,
        id: &'a InstanceId,
        enabled: bool,
    ) -> CloudFuture<'a, ()> {
        let target = format!("{id}:{enabled}");
        respond(self.state().record(CloudOp::ModifySourceDestCheck, &target))
    }

    fn replace_route<'a>(
        &'a self,
        table_id: &'a str,
        destination: &'a str,
        instance_id: &'a InstanceId,
    ) -> CloudFuture<'a, ()> {
        let target = format!("{table_id}:{destination}:{instance_id}");
        respond(self.state().record(CloudOp::ReplaceRoute, &target))
    }

    fn create_volume<'a>(&'a self, request: &'a CreateVolumeRequest) -> CloudFuture<'a, Volume> {
        let mut state = self.state();
        let result = state
            .record(CloudOp::CreateVolume, &request.availability_zone)
            .map(|()| {
                state.created_volumes += 1;
                let mut volume = available_volume(
                    &format!("vol-new-{}", state.created_volumes),
                    &request.availability_zone,
                );
                volume.size_gib = request.size_gib;
                state.volumes.insert(volume.id.clone(), volume.clone());
                Volume {
                    state: VolumeState::Creating,
                    ..volume
                }
            });
        respond(result)
    }

    fn describe_volume<'a>(&'a self, id: &'a DiskId) -> CloudFuture<'a, Volume> {
        let mut state = self.state();
        let result = state.record(CloudOp::DescribeVolume, id).and_then(|()| {
            state
                .volumes
                .get(id)
                .cloned()
                .ok_or_else(|| volume_not_found(id))
        });
        respond(result)
    }

    fn delete_volume<'a>(&'a self, id: &'a DiskId) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.record(CloudOp::DeleteVolume, id).and_then(|()| {
            state
                .volumes
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| volume_not_found(id))
        });
        respond(result)
    }

    fn create_tags<'a>(
        &'a self,
        resource_id: &'a str,
        tags: &'a [(String, String)],
    ) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.record(CloudOp::CreateTags, resource_id).and_then(|()| {
            let is_volume = resource_id.starts_with("vol-");
            if is_volume && !state.volumes.contains_key(&DiskId::from(resource_id)) {
                return Err(CloudApiError::VolumeNotFound {
                    volume_id: resource_id.to_owned(),
                });
            }
            state
                .tags
                .entry(resource_id.to_owned())
                .or_default()
                .extend(tags.iter().cloned());
            Ok(())
        });
        respond(result)
    }

    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        volume_id: &'a DiskId,
        device: &'a str,
    ) -> CloudFuture<'a, VolumeAttachment> {
        let mut state = self.state();
        let result = state
            .record(CloudOp::AttachVolume, volume_id)
            .and_then(|()| {
                let volume = state
                    .volumes
                    .get_mut(volume_id)
                    .ok_or_else(|| volume_not_found(volume_id))?;
                let attachment = VolumeAttachment {
                    device: device.to_owned(),
                    instance_id: instance_id.clone(),
                    volume_id: volume_id.clone(),
                    state: AttachmentState::Attached,
                };
                volume.state = VolumeState::InUse;
                volume.attachments = vec![attachment.clone()];
                if let Some(instance) = state.instances.get_mut(instance_id) {
                    instance.block_device_mappings.push(BlockDeviceMapping {
                        device_name: device.to_owned(),
                        volume_id: Some(volume_id.clone()),
                    });
                }
                Ok(VolumeAttachment {
                    state: AttachmentState::Attaching,
                    ..attachment
                })
            });
        respond(result)
    }

    fn detach_volume<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        volume_id: &'a DiskId,
        device: &'a str,
        _force: bool,
    ) -> CloudFuture<'a, VolumeAttachment> {
        let mut state = self.state();
        let result = state
            .record(CloudOp::DetachVolume, volume_id)
            .and_then(|()| {
                let volume = state
                    .volumes
                    .get_mut(volume_id)
                    .ok_or_else(|| volume_not_found(volume_id))?;
                volume.state = VolumeState::Available;
                volume.attachments.clear();
                if let Some(instance) = state.instances.get_mut(instance_id) {
                    instance
                        .block_device_mappings
                        .retain(|mapping| mapping.volume_id.as_ref() != Some(volume_id));
                }
                Ok(VolumeAttachment {
                    device: device.to_owned(),
                    instance_id: instance_id.clone(),
                    volume_id: volume_id.clone(),
                    state: AttachmentState::Detaching,
                })
            });
        respond(result)
    }

    fn describe_subnet<'a>(&'a self, subnet_id: &'a str) -> CloudFuture<'a, Subnet> {
        let mut state = self.state();
        let result = state.record(CloudOp::DescribeSubnet, subnet_id).and_then(|()| {
            state
                .subnets
                .get(subnet_id)
                .cloned()
                .ok_or_else(|| CloudApiError::Other {
                    code: String::from("InvalidSubnetID.NotFound"),
                    message: format!("subnet {subnet_id} does not exist"),
                })
        });
        respond(result)
    }

    fn describe_address<'a>(&'a self, public_ip: &'a str) -> CloudFuture<'a, Option<Address>> {
        let mut state = self.state();
        let result = state
            .record(CloudOp::DescribeAddress, public_ip)
            .map(|()| state.addresses.get(public_ip).cloned());
        respond(result)
    }
}

fn volume_not_found(id: &DiskId) -> CloudApiError {
    CloudApiError::VolumeNotFound {
        volume_id: id.to_string(),
    }
}

/// Fleet API operations that can be scripted to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FleetOp {
    /// `create_group`.
    Create,
    /// `read_group`.
    Read,
    /// `update_group`.
    Update,
    /// `delete_group`.
    Delete,
    /// `group_status`.
    Status,
    /// `lookup_instance`.
    Lookup,
}

#[derive(Debug, Default)]
struct FleetState {
    groups: BTreeMap<String, String>,
    members: BTreeMap<String, Vec<GroupMember>>,
    empty_polls: BTreeMap<String, u32>,
    pending_instances: VecDeque<String>,
    empty_polls_per_group: u32,
    created: Vec<GroupSpec>,
    updates: Vec<(String, GroupUpdate)>,
    deletes: Vec<(String, DeleteOptions)>,
    status_calls: u32,
    failures: BTreeMap<FleetOp, VecDeque<FleetError>>,
}

impl FleetState {
    fn fail(&mut self, op: FleetOp) -> Result<(), FleetError> {
        self.failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
            .map_or(Ok(()), Err)
    }
}

/// In-memory fleet API with scripted pool fulfilment.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFleet {
    state: Arc<Mutex<FleetState>>,
}

impl ScriptedFleet {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds an existing pool backed by `instance_id`, if any.
    pub fn insert_group(&self, group_id: &str, instance_id: Option<&str>) {
        let mut state = self.state();
        state
            .groups
            .insert(group_id.to_owned(), format!("bosh/{group_id}"));
        state
            .members
            .insert(group_id.to_owned(), instance_id.map(member).into_iter().collect());
    }

    /// Seeds a status entry for a pool the fleet no longer knows, so
    /// deletion reports it absent while `instance_id` still resolves.
    pub fn insert_orphaned_member(&self, group_id: &str, instance_id: &str) {
        self.state()
            .members
            .insert(group_id.to_owned(), vec![member(instance_id)]);
    }

    /// Queues the instance that backs the next created pool.
    pub fn queue_instance(&self, instance_id: &str) {
        self.state()
            .pending_instances
            .push_back(instance_id.to_owned());
    }

    /// Makes each newly created pool report `polls` empty statuses first.
    pub fn set_empty_status_polls(&self, polls: u32) {
        self.state().empty_polls_per_group = polls;
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: FleetOp, error: FleetError) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Whether the pool still exists.
    #[must_use]
    pub fn has_group(&self, group_id: &str) -> bool {
        self.state().groups.contains_key(group_id)
    }

    /// Specifications submitted for creation.
    #[must_use]
    pub fn created(&self) -> Vec<GroupSpec> {
        self.state().created.clone()
    }

    /// Updates applied, with their pool id.
    #[must_use]
    pub fn updates(&self) -> Vec<(String, GroupUpdate)> {
        self.state().updates.clone()
    }

    /// Pool ids deletion was requested for, in order.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state()
            .deletes
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Options sent with each deletion.
    #[must_use]
    pub fn delete_options(&self) -> Vec<DeleteOptions> {
        self.state()
            .deletes
            .iter()
            .map(|(_, options)| options.clone())
            .collect()
    }

    /// Number of status polls made.
    #[must_use]
    pub fn status_calls(&self) -> u32 {
        self.state().status_calls
    }
}

fn member(instance_id: &str) -> GroupMember {
    GroupMember {
        instance_id: Some(instance_id.to_owned()),
        status: Some(String::from("fulfilled")),
        availability_zone: None,
    }
}

fn group_missing(operation: String) -> FleetError {
    FleetError::Api {
        operation,
        status: 400,
        code: String::from("GROUP_DOESNT_EXIST"),
        message: String::from("group does not exist"),
    }
}

fn fleet_respond<'a, T: Send + 'a>(result: Result<T, FleetError>) -> FleetFuture<'a, T> {
    Box::pin(ready(result))
}

impl FleetApi for ScriptedFleet {
    fn create_group<'a>(&'a self, spec: &'a GroupSpec) -> FleetFuture<'a, GroupRecord> {
        let mut state = self.state();
        let result = state.fail(FleetOp::Create).map(|()| {
            state.created.push(spec.clone());
            let id = format!("sig-{}", state.created.len());
            let members = state
                .pending_instances
                .pop_front()
                .map(|instance_id| member(&instance_id))
                .into_iter()
                .collect();
            let polls = state.empty_polls_per_group;
            state.groups.insert(id.clone(), spec.name.clone());
            state.members.insert(id.clone(), members);
            state.empty_polls.insert(id.clone(), polls);
            GroupRecord {
                id,
                name: Some(spec.name.clone()),
            }
        });
        fleet_respond(result)
    }

    fn read_group<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Option<GroupRecord>> {
        let mut state = self.state();
        let result = state.fail(FleetOp::Read).map(|()| {
            state.groups.get(group_id.as_str()).map(|name| GroupRecord {
                id: group_id.to_string(),
                name: Some(name.clone()),
            })
        });
        fleet_respond(result)
    }

    fn update_group<'a>(
        &'a self,
        group_id: &'a VmId,
        update: &'a GroupUpdate,
    ) -> FleetFuture<'a, GroupRecord> {
        let mut state = self.state();
        let result = state.fail(FleetOp::Update).and_then(|()| {
            let current = state
                .groups
                .get(group_id.as_str())
                .cloned()
                .ok_or_else(|| group_missing(format!("PUT /group/{group_id}")))?;
            state.updates.push((group_id.to_string(), update.clone()));
            let name = update.name.clone().unwrap_or(current);
            state.groups.insert(group_id.to_string(), name.clone());
            Ok(GroupRecord {
                id: group_id.to_string(),
                name: Some(name),
            })
        });
        fleet_respond(result)
    }

    fn delete_group<'a>(
        &'a self,
        group_id: &'a VmId,
        options: &'a DeleteOptions,
    ) -> FleetFuture<'a, bool> {
        let mut state = self.state();
        let result = state.fail(FleetOp::Delete).map(|()| {
            state.deletes.push((group_id.to_string(), options.clone()));
            state.members.remove(group_id.as_str());
            state.groups.remove(group_id.as_str()).is_some()
        });
        fleet_respond(result)
    }

    fn group_status<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Vec<GroupMember>> {
        let mut state = self.state();
        state.status_calls += 1;
        let result = state.fail(FleetOp::Status).map(|()| {
            if let Some(remaining) = state
                .empty_polls
                .get_mut(group_id.as_str())
                .filter(|remaining| **remaining > 0)
            {
                *remaining -= 1;
                return Vec::new();
            }
            state
                .members
                .get(group_id.as_str())
                .cloned()
                .unwrap_or_default()
        });
        fleet_respond(result)
    }

    fn lookup_instance<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> FleetFuture<'a, Option<FleetInstance>> {
        let mut state = self.state();
        let result = state.fail(FleetOp::Lookup).map(|()| {
            state.members.iter().find_map(|(group_id, members)| {
                members
                    .iter()
                    .any(|candidate| candidate.instance_id.as_deref() == Some(instance_id.as_str()))
                    .then(|| FleetInstance {
                        instance_id: instance_id.to_string(),
                        group_id: Some(group_id.clone()),
                        lifecycle: Some(String::from("SPOT")),
                    })
            })
        });
        fleet_respond(result)
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets environment variables while holding the global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `removed` while holding the global mutex.
    pub async fn apply(pairs: &[(&str, &str)], removed: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(removed.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + removed.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in removed {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
