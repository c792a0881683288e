//! Keeps denormalized collections in step with the resources they mirror.
//!
//! A parent such as a host carries `instances`, a cached copy of "every
//! instance whose `hosts` pointer names me". The feed only tells us about the
//! instance, so each change is fanned out to the parents it should (or should
//! no longer) appear on.
//!
//! Fetch-then-mutate steps are spawned and never awaited by the caller. The
//! graph converges once they land; [`Pending::settled`] exists for callers
//! that need to observe that point (tests, replay).

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::decoder::ResourceChange;
use crate::error::SyncError;
use crate::resource::ResourceRef;
use crate::store::Store;

pub const BALANCER_CONFIG_RELATION: &str = "loadBalancerConfig";
pub const BALANCER_CONFIG_KIND: &str = "loadBalancerConfig";
pub const BALANCER_CONFIG_POINTER: &str = "loadBalancerConfigId";
pub const BALANCERS_FIELD: &str = "loadBalancers";
pub const VOLUME_KIND: &str = "volume";
pub const MOUNTS_FIELD: &str = "mounts";
pub const MOUNT_POINTER: &str = "volumeId";

/// Which parent collection mirrors which pointer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeRule {
    pub parent_kind: &'static str,
    pub dest_field: &'static str,
    pub pointer_field: &'static str,
}

impl IncludeRule {
    pub const fn new(
        parent_kind: &'static str,
        dest_field: &'static str,
        pointer_field: &'static str,
    ) -> Self {
        Self {
            parent_kind,
            dest_field,
            pointer_field,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Include(IncludeRule),
    /// Balancer membership in its single resolved config.
    BalancerConfig,
    /// Mount replace-or-append on its volume.
    Mount,
}

const HOST_INSTANCES: IncludeRule = IncludeRule::new("host", "instances", "hosts");
const ENVIRONMENT_SERVICES: IncludeRule =
    IncludeRule::new("environment", "services", "environmentId");

/// Resource kind of a change → how to repair the graph.
pub const HANDLERS: &[(&str, Handler)] = &[
    ("container", Handler::Include(HOST_INSTANCES)),
    ("instance", Handler::Include(HOST_INSTANCES)),
    (
        "ipAddress",
        Handler::Include(IncludeRule::new("host", "ipAddresses", "hosts")),
    ),
    (
        "host",
        Handler::Include(IncludeRule::new("machine", "hosts", "physicalHostId")),
    ),
    (
        "loadBalancerTarget",
        Handler::Include(IncludeRule::new(
            "loadBalancer",
            "loadBalancerTargets",
            "loadBalancerId",
        )),
    ),
    (
        "registryCredential",
        Handler::Include(IncludeRule::new("registry", "credentials", "registryId")),
    ),
    ("service", Handler::Include(ENVIRONMENT_SERVICES)),
    ("loadBalancerService", Handler::Include(ENVIRONMENT_SERVICES)),
    ("dnsService", Handler::Include(ENVIRONMENT_SERVICES)),
    ("externalService", Handler::Include(ENVIRONMENT_SERVICES)),
    ("loadBalancer", Handler::BalancerConfig),
    ("mount", Handler::Mount),
    // No `loadBalancerConfig` entry: a config carries no pointer to the
    // balancers or listeners that use it, so there is no parent to repair.
    // Balancer changes keep `loadBalancers` current from the other side.
];

pub fn handler_for(kind: &str) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(candidate, _)| *candidate == kind)
        .map(|(_, handler)| *handler)
}

/// Background mutations started by one reconcile call.
#[derive(Debug, Default)]
#[must_use = "drop to fire-and-forget, or await `settled` to observe convergence"]
pub struct Pending {
    tasks: Vec<JoinHandle<()>>,
}

impl Pending {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn extend(&mut self, other: Pending) {
        self.tasks.extend(other.tasks);
    }

    /// Forgets tasks that already finished.
    pub fn prune(&mut self) {
        self.tasks.retain(|task| !task.is_finished());
    }

    /// Cancels every step that has not landed yet.
    pub fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Waits for every spawned mutation. Task panics and cancellations are
    /// swallowed.
    pub async fn settled(self) {
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                debug!(error = %err, "Reconcile task did not complete");
            }
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    terminal_states: Arc<BTreeSet<String>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, config: &SyncConfig) -> Self {
        Self {
            store,
            terminal_states: Arc::new(config.terminal_states.clone()),
        }
    }

    fn is_terminal(&self, state: Option<&str>) -> bool {
        is_terminal(&self.terminal_states, state)
    }

    /// Dispatches a decoded change to its handler.
    pub fn apply(&self, change: &ResourceChange) -> Pending {
        match handler_for(&change.resource_type) {
            Some(Handler::Include(rule)) => self.reconcile(rule, &change.resource),
            Some(Handler::BalancerConfig) => {
                self.balancer_changed(&change.resource);
                Pending::default()
            }
            Some(Handler::Mount) => {
                self.mount_changed(&change.resource);
                Pending::default()
            }
            None => {
                trace!(resource_type = %change.resource_type, "No handler for resource type");
                Pending::default()
            }
        }
    }

    /// Repairs `rule.dest_field` on every parent the changed resource should
    /// join or leave. Must be called from within a tokio runtime.
    pub fn reconcile(&self, rule: IncludeRule, changed: &ResourceRef) -> Pending {
        let changed_id = changed.id().to_string();
        let expected: BTreeSet<String> = {
            let resource = changed.read();
            if self.is_terminal(resource.state()) {
                BTreeSet::new()
            } else {
                resource.pointer_ids(rule.pointer_field)
            }
        };

        let current: BTreeSet<String> = self
            .store
            .all(rule.parent_kind)
            .into_iter()
            .filter(|parent| parent.read().collection_contains(rule.dest_field, &changed_id))
            .map(|parent| parent.id().to_string())
            .collect();

        debug!(
            resource = %changed.key(),
            parent_kind = rule.parent_kind,
            dest_field = rule.dest_field,
            expected = ?expected,
            current = ?current,
            "Reconciling include"
        );

        let mut pending = Pending::default();
        for parent_id in current.difference(&expected) {
            pending
                .tasks
                .push(self.spawn_remove(rule, parent_id.clone(), changed.clone()));
        }
        for parent_id in expected.difference(&current) {
            pending
                .tasks
                .push(self.spawn_add(rule, parent_id.clone(), changed.clone()));
        }
        pending
    }

    fn spawn_remove(
        &self,
        rule: IncludeRule,
        parent_id: String,
        changed: ResourceRef,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let terminal_states = Arc::clone(&self.terminal_states);
        let generation = store.generation();
        tokio::spawn(async move {
            if outlived(store.as_ref(), generation, rule, &parent_id) {
                return;
            }
            match store.find(rule.parent_kind, &parent_id).await {
                Ok(parent) => {
                    if outlived(store.as_ref(), generation, rule, &parent_id) {
                        return;
                    }
                    if belongs_to(&changed, rule, &parent_id, &terminal_states) {
                        trace!(parent = %parent.key(), "Pointer moved back; keeping member");
                        return;
                    }
                    let removed = parent
                        .write()
                        .remove_from_collection(rule.dest_field, changed.id());
                    if removed > 0 {
                        debug!(
                            parent = %parent.key(),
                            dest_field = rule.dest_field,
                            removed = %changed.key(),
                            "Removed from include"
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        error = %err,
                        parent_kind = rule.parent_kind,
                        parent_id = %parent_id,
                        "Parent lookup failed; skipping removal"
                    );
                }
            }
        })
    }

    fn spawn_add(
        &self,
        rule: IncludeRule,
        parent_id: String,
        changed: ResourceRef,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let terminal_states = Arc::clone(&self.terminal_states);
        let generation = store.generation();
        tokio::spawn(async move {
            if outlived(store.as_ref(), generation, rule, &parent_id) {
                return;
            }
            match store.find(rule.parent_kind, &parent_id).await {
                Ok(parent) => {
                    if outlived(store.as_ref(), generation, rule, &parent_id) {
                        return;
                    }
                    if !belongs_to(&changed, rule, &parent_id, &terminal_states) {
                        trace!(parent = %parent.key(), "Pointer moved on; skipping add");
                        return;
                    }
                    let mut guard = parent.write();
                    let members = guard.collection_mut(rule.dest_field);
                    if !members.iter().any(|member| member.id() == changed.id()) {
                        members.push(changed.clone());
                        debug!(
                            parent = %parent.key(),
                            dest_field = rule.dest_field,
                            added = %changed.key(),
                            "Added to include"
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        error = %err,
                        parent_kind = rule.parent_kind,
                        parent_id = %parent_id,
                        "Parent lookup failed; skipping addition"
                    );
                }
            }
        })
    }

    /// Toggles the balancer's membership in its config's `loadBalancers`.
    pub fn balancer_changed(&self, balancer: &ResourceRef) {
        let (config, terminal) = {
            let resource = balancer.read();
            let config = resource.relation(BALANCER_CONFIG_RELATION).or_else(|| {
                resource
                    .pointer_ids(BALANCER_CONFIG_POINTER)
                    .into_iter()
                    .next()
                    .and_then(|id| self.store.get_by_id(BALANCER_CONFIG_KIND, &id))
            });
            (config, self.is_terminal(resource.state()))
        };

        let Some(config) = config else {
            debug!(balancer = %balancer.key(), "Balancer has no resolved config");
            return;
        };
        if config.same_instance(balancer) {
            return;
        }

        let mut guard = config.write();
        if terminal {
            guard.remove_from_collection(BALANCERS_FIELD, balancer.id());
        } else {
            let members = guard.collection_mut(BALANCERS_FIELD);
            if !members.iter().any(|member| member.id() == balancer.id()) {
                members.push(balancer.clone());
            }
        }
    }

    /// Replace-or-append on the owning volume's `mounts`, from local cache only.
    pub fn mount_changed(&self, mount: &ResourceRef) {
        let (volume_id, terminal) = {
            let resource = mount.read();
            (
                resource.pointer_ids(MOUNT_POINTER).into_iter().next(),
                self.is_terminal(resource.state()),
            )
        };

        let Some(volume) = volume_id
            .as_deref()
            .and_then(|id| self.store.get_by_id(VOLUME_KIND, id))
        else {
            let miss = SyncError::LookupMiss {
                kind: VOLUME_KIND.to_string(),
                id: volume_id.unwrap_or_default(),
            };
            debug!(mount = %mount.key(), error = %miss, "Skipping mount");
            return;
        };

        if terminal {
            volume.write().remove_from_collection(MOUNTS_FIELD, mount.id());
            return;
        }

        let existing = volume.read().collection(MOUNTS_FIELD).and_then(|members| {
            members
                .iter()
                .find(|member| member.id() == mount.id())
                .cloned()
        });

        match existing {
            Some(existing) if existing.same_instance(mount) => {}
            Some(existing) => {
                let update = mount.read().clone();
                existing.write().overwrite_from(&update);
            }
            None => volume.write().collection_mut(MOUNTS_FIELD).push(mount.clone()),
        }
    }
}

fn is_terminal(terminal_states: &BTreeSet<String>, state: Option<&str>) -> bool {
    state
        .map(|state| terminal_states.contains(state))
        .unwrap_or(false)
}

/// True once the store has been reset since the step was spawned. The
/// parent it was fetching belongs to the previous session.
fn outlived(store: &dyn Store, generation: u64, rule: IncludeRule, parent_id: &str) -> bool {
    if store.generation() == generation {
        return false;
    }
    let miss = SyncError::LookupMiss {
        kind: rule.parent_kind.to_string(),
        id: parent_id.to_string(),
    };
    trace!(error = %miss, generation, "Store reset under reconcile step; dropping it");
    true
}

/// Re-read at landing time: a later change may have moved the pointer since
/// the step was spawned.
fn belongs_to(
    changed: &ResourceRef,
    rule: IncludeRule,
    parent_id: &str,
    terminal_states: &BTreeSet<String>,
) -> bool {
    let resource = changed.read();
    !is_terminal(terminal_states, resource.state())
        && resource.pointer_ids(rule.pointer_field).contains(parent_id)
}
