//! Cross-object subscription registry.
//!
//! Reads performed during a reconcile become subscriptions: when the read
//! target later changes, the reading object is re-enqueued with the `_t `
//! marker. Subscriptions are keyed by the dependent, so deleting the
//! dependent drops everything it registered.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rudder_core::{FieldSelector, Kind, LabelSelector, Obj};
use rudder_runtime::RuntimeBackend;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::handler_set::{HandlerSet, TRIGGER_PREFIX};
use crate::RuntimeError;

/// The dependent side of a subscription: the object to re-enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnqueueTarget {
    pub kind: Kind,
    pub key: String,
}

/// The watched side of a subscription. Empty namespace/name mean "any";
/// empty selectors match everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectMatcher {
    pub namespace: String,
    pub name: String,
    pub selector: LabelSelector,
    pub fields: FieldSelector,
}

impl ObjectMatcher {
    pub fn matches(&self, namespace: &str, name: &str, obj: Option<&Obj>) -> bool {
        if !self.namespace.is_empty() && self.namespace != namespace {
            return false;
        }
        if !self.name.is_empty() && self.name != name {
            return false;
        }
        if !self.selector.is_empty() {
            match obj {
                Some(o) => {
                    if !self.selector.matches(&o.meta.labels) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !self.fields.is_empty() {
            match obj {
                Some(o) => {
                    if !self.fields.matches(o) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

type MatcherTable = FxHashMap<Kind, FxHashMap<EnqueueTarget, Vec<ObjectMatcher>>>;

/// Flat table of subscriptions: watched kind → dependent → matchers.
pub struct Triggers {
    backend: Arc<RuntimeBackend>,
    state: Mutex<MatcherTable>,
}

impl Triggers {
    pub fn new(backend: Arc<RuntimeBackend>) -> Self {
        Self { backend, state: Mutex::new(MatcherTable::default()) }
    }

    /// Records that `dependent` wants a re-enqueue whenever a matching object
    /// of `watched` changes. Idempotent.
    pub fn register(
        &self,
        dependent: &EnqueueTarget,
        watched: &Kind,
        namespace: &str,
        name: &str,
        selector: &LabelSelector,
        fields: &FieldSelector,
    ) -> bool {
        let matcher = ObjectMatcher {
            namespace: namespace.to_string(),
            name: name.to_string(),
            selector: selector.clone(),
            fields: fields.clone(),
        };
        let mut state = self.state.lock().unwrap();
        let matchers = state
            .entry(watched.clone())
            .or_default()
            .entry(dependent.clone())
            .or_default();
        if matchers.contains(&matcher) {
            return false;
        }
        debug!(
            watched = %watched,
            dependent_kind = %dependent.kind,
            dependent_key = %dependent.key,
            "subscription added"
        );
        matchers.push(matcher);
        true
    }

    /// Fans an object change out to every matching dependent. The changed
    /// object itself is skipped.
    pub async fn trigger(&self, kind: &Kind, key: &str, namespace: &str, name: &str, obj: Option<&Obj>) {
        let targets: Vec<EnqueueTarget> = {
            let state = self.state.lock().unwrap();
            let Some(by_target) = state.get(kind) else {
                return;
            };
            by_target
                .iter()
                .filter(|(target, _)| !(target.kind == *kind && target.key == key))
                .filter(|(_, matchers)| matchers.iter().any(|m| m.matches(namespace, name, obj)))
                .map(|(target, _)| target.clone())
                .collect()
        };

        for target in targets {
            counter!("trigger_fanout_total", 1u64);
            debug!(
                changed_kind = %kind,
                changed_key = %key,
                dependent_kind = %target.kind,
                dependent_key = %target.key,
                "triggering dependent"
            );
            let triggered_key = format!("{}{}", TRIGGER_PREFIX, target.key);
            if let Err(e) = self.backend.trigger(&target.kind, &triggered_key, Duration::ZERO).await {
                debug!(kind = %target.kind, key = %target.key, error = %e, "trigger dropped");
            }
        }
    }

    /// Drops every subscription owned by the deleted dependent, then fans the
    /// deletion out to whatever watched it.
    pub async fn unregister_and_trigger(
        &self,
        kind: &Kind,
        key: &str,
        namespace: &str,
        name: &str,
        obj: Option<&Obj>,
    ) {
        let dependent = EnqueueTarget { kind: kind.clone(), key: key.to_string() };
        {
            let mut state = self.state.lock().unwrap();
            for by_target in state.values_mut() {
                by_target.remove(&dependent);
            }
            state.retain(|_, by_target| !by_target.is_empty());
        }
        debug!(kind = %kind, key = %key, "subscriptions dropped");
        self.trigger(kind, key, namespace, name, obj).await;
    }

    /// Stable serialization of the subscription graph, for debugging.
    pub fn dump(&self, indent: bool) -> String {
        let state = self.state.lock().unwrap();
        let mut out: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for (watched, by_target) in state.iter() {
            let mut grouped: BTreeMap<String, (serde_json::Value, Vec<String>)> = BTreeMap::new();
            for (target, matchers) in by_target {
                for m in matchers {
                    let matcher_key = format!(
                        "{}|{}|{}|{}",
                        m.namespace, m.name, m.selector, m.fields
                    );
                    let entry = grouped.entry(matcher_key).or_insert_with(|| {
                        (
                            serde_json::json!({
                                "namespace": m.namespace,
                                "name": m.name,
                                "selector": m.selector.to_string(),
                                "fieldSelector": m.fields.to_string(),
                            }),
                            Vec::new(),
                        )
                    });
                    entry.1.push(format!("{} {}", target.kind, target.key));
                }
            }
            let entries = grouped
                .into_values()
                .map(|(mut matcher, mut dependents)| {
                    dependents.sort();
                    matcher["dependents"] = serde_json::json!(dependents);
                    matcher
                })
                .collect();
            out.insert(watched.to_string(), entries);
        }
        if indent {
            serde_json::to_string_pretty(&out).unwrap_or_default()
        } else {
            serde_json::to_string(&out).unwrap_or_default()
        }
    }
}

/// Per-reconcile handle: knows the dependent, records its reads, and makes
/// sure a watcher exists on everything it subscribes to.
pub struct RequestTriggers {
    dependent: EnqueueTarget,
    set: Arc<HandlerSet>,
    watched: Mutex<FxHashSet<Kind>>,
}

impl RequestTriggers {
    pub(crate) fn new(dependent: EnqueueTarget, set: Arc<HandlerSet>) -> Arc<Self> {
        Arc::new(Self { dependent, set, watched: Mutex::new(FxHashSet::default()) })
    }

    pub async fn watch(
        &self,
        kind: &Kind,
        namespace: &str,
        name: &str,
        selector: &LabelSelector,
        fields: &FieldSelector,
    ) -> Result<(), RuntimeError> {
        self.set.watch_kind(kind).await?;
        self.set
            .triggers()
            .register(&self.dependent, kind, namespace, name, selector, fields);
        self.watched.lock().unwrap().insert(kind.clone());
        Ok(())
    }

    pub fn watching(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self.watched.lock().unwrap().iter().cloned().collect();
        kinds.sort();
        kinds
    }
}
