//! Checks the cached graph against the link invariant.
//!
//! For every include rule, a cached parent's collection must hold exactly the
//! cached, non-terminal children whose pointer names that parent. Volumes and
//! balancer configs only get the weaker member-side check, since those
//! handlers never fetch.
//!
//! A mount or balancer whose pointer moved stays on its old parent: those
//! handlers only touch the parent the member points at now. Such members are
//! reported by [`orphaned_members`] and do not count as violations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::config::SyncConfig;
use crate::reconcile::{
    Handler, IncludeRule, BALANCERS_FIELD, BALANCER_CONFIG_KIND, BALANCER_CONFIG_POINTER,
    BALANCER_CONFIG_RELATION, HANDLERS, MOUNTS_FIELD, MOUNT_POINTER, VOLUME_KIND,
};
use crate::resource::ResourceRef;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Problem {
    /// Child points at the parent but is not in its collection.
    Missing,
    /// Member no longer points at the parent.
    Stale,
    /// Member is in a terminal state.
    Terminal,
    /// Member listed more than once.
    Duplicate,
    /// Mount or balancer left behind on a parent it no longer points at.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LinkViolation {
    pub parent: String,
    pub field: String,
    pub member: String,
    pub problem: Problem,
}

impl fmt::Display for LinkViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} / {}: {:?}",
            self.parent, self.field, self.member, self.problem
        )
    }
}

/// Include rules with the child kinds that feed each one.
pub fn include_rules() -> Vec<(IncludeRule, Vec<&'static str>)> {
    let mut rules: Vec<(IncludeRule, Vec<&'static str>)> = Vec::new();
    for (kind, handler) in HANDLERS {
        let Handler::Include(rule) = handler else {
            continue;
        };
        match rules.iter_mut().find(|(existing, _)| *existing == *rule) {
            Some((_, kinds)) => kinds.push(*kind),
            None => rules.push((*rule, vec![*kind])),
        }
    }
    rules
}

pub fn check_links(store: &dyn Store, config: &SyncConfig) -> Vec<LinkViolation> {
    let mut violations = Vec::new();
    for (rule, child_kinds) in include_rules() {
        check_include(store, config, rule, &child_kinds, &mut violations);
    }
    violations.extend(
        member_problems(store, config)
            .into_iter()
            .filter(|violation| violation.problem != Problem::Orphaned),
    );
    violations.sort();
    violations
}

/// Mounts and balancers still listed on a parent they no longer point at.
pub fn orphaned_members(store: &dyn Store, config: &SyncConfig) -> Vec<LinkViolation> {
    let mut orphans: Vec<LinkViolation> = member_problems(store, config)
        .into_iter()
        .filter(|violation| violation.problem == Problem::Orphaned)
        .collect();
    orphans.sort();
    orphans
}

/// `"kind:id.field"` → member count, for every non-empty collection in the
/// cache.
pub fn collection_sizes(store: &dyn Store) -> BTreeMap<String, usize> {
    let mut kinds: BTreeSet<&str> = BTreeSet::new();
    for (rule, _) in include_rules() {
        kinds.insert(rule.parent_kind);
    }
    kinds.insert(VOLUME_KIND);
    kinds.insert(BALANCER_CONFIG_KIND);

    let mut sizes = BTreeMap::new();
    for kind in kinds {
        for parent in store.all(kind) {
            let resource = parent.read();
            for name in resource.collection_names() {
                let len = resource.collection(name).map(<[_]>::len).unwrap_or(0);
                if len > 0 {
                    sizes.insert(format!("{}.{}", parent.key(), name), len);
                }
            }
        }
    }
    sizes
}

fn check_include(
    store: &dyn Store,
    config: &SyncConfig,
    rule: IncludeRule,
    child_kinds: &[&str],
    violations: &mut Vec<LinkViolation>,
) {
    let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for kind in child_kinds {
        for child in store.all(kind) {
            let resource = child.read();
            if config.is_terminal(resource.state()) {
                continue;
            }
            for parent_id in resource.pointer_ids(rule.pointer_field) {
                expected
                    .entry(parent_id)
                    .or_default()
                    .insert(child.id().to_string());
            }
        }
    }

    for parent in store.all(rule.parent_kind) {
        let members: Vec<ResourceRef> = parent
            .read()
            .collection(rule.dest_field)
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        let want = expected.remove(parent.id()).unwrap_or_default();
        let mut seen = BTreeSet::new();
        for member in &members {
            let violation = |problem| LinkViolation {
                parent: parent.key().to_string(),
                field: rule.dest_field.to_string(),
                member: member.key().to_string(),
                problem,
            };
            if !seen.insert(member.id().to_string()) {
                violations.push(violation(Problem::Duplicate));
            } else if config.is_terminal(member.state().as_deref()) {
                violations.push(violation(Problem::Terminal));
            } else if !member.read().pointer_ids(rule.pointer_field).contains(parent.id()) {
                violations.push(violation(Problem::Stale));
            }
        }

        for child_id in want.difference(&seen) {
            violations.push(LinkViolation {
                parent: parent.key().to_string(),
                field: rule.dest_field.to_string(),
                member: child_id.clone(),
                problem: Problem::Missing,
            });
        }
    }
}

fn member_problems(store: &dyn Store, config: &SyncConfig) -> Vec<LinkViolation> {
    let mut problems = Vec::new();
    check_members(
        store,
        config,
        VOLUME_KIND,
        MOUNTS_FIELD,
        |member| member.read().pointer_ids(MOUNT_POINTER),
        &mut problems,
    );
    check_members(
        store,
        config,
        BALANCER_CONFIG_KIND,
        BALANCERS_FIELD,
        balancer_config_ids,
        &mut problems,
    );
    problems
}

fn check_members<F>(
    store: &dyn Store,
    config: &SyncConfig,
    parent_kind: &str,
    field: &str,
    owners_of: F,
    violations: &mut Vec<LinkViolation>,
) where
    F: Fn(&ResourceRef) -> BTreeSet<String>,
{
    for parent in store.all(parent_kind) {
        let members: Vec<ResourceRef> = parent
            .read()
            .collection(field)
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        let mut seen = BTreeSet::new();
        for member in &members {
            let problem = if !seen.insert(member.id().to_string()) {
                Problem::Duplicate
            } else if config.is_terminal(member.state().as_deref()) {
                Problem::Terminal
            } else if !owners_of(member).contains(parent.id()) {
                Problem::Orphaned
            } else {
                continue;
            };
            violations.push(LinkViolation {
                parent: parent.key().to_string(),
                field: field.to_string(),
                member: member.key().to_string(),
                problem,
            });
        }
    }
}

fn balancer_config_ids(balancer: &ResourceRef) -> BTreeSet<String> {
    let resource = balancer.read();
    match resource.relation(BALANCER_CONFIG_RELATION) {
        Some(config) => BTreeSet::from([config.id().to_string()]),
        None => resource.pointer_ids(BALANCER_CONFIG_POINTER),
    }
}
