//! The opaque typed object record and key helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::kind::Kind;

/// Standard metadata carried by every object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjMeta {
    pub kind: Kind,
    /// Empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Store-assigned identity; empty until first persisted.
    #[serde(default)]
    pub uid: String,
    /// Monotonic per object; opaque tokens tolerated.
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: String,
    #[serde(default, rename = "creationTimestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "deletionTimestamp")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalizers: SmallVec<[String; 4]>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// An object: metadata plus opaque user state split into spec and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obj {
    #[serde(rename = "metadata")]
    pub meta: ObjMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl Obj {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ObjMeta {
                kind,
                namespace: namespace.into(),
                name: name.into(),
                uid: String::new(),
                resource_version: String::new(),
                creation_timestamp: None,
                deletion_timestamp: None,
                finalizers: SmallVec::new(),
                labels: BTreeMap::new(),
            },
            spec: Value::Null,
            status: Value::Null,
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.meta.labels = labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Canonical `ns/name` (or `name`) address of this object.
    pub fn key(&self) -> String {
        key_for(&self.meta.namespace, &self.meta.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, id: &str) -> bool {
        self.meta.finalizers.iter().any(|f| f == id)
    }

    pub fn add_finalizer(&mut self, id: &str) -> bool {
        if self.has_finalizer(id) {
            return false;
        }
        self.meta.finalizers.push(id.to_string());
        true
    }

    pub fn remove_finalizer(&mut self, id: &str) -> bool {
        let before = self.meta.finalizers.len();
        self.meta.finalizers.retain(|f| f != id);
        self.meta.finalizers.len() != before
    }

    /// Resolve a dotted field path (`metadata.name`, `spec.replicas`) to its
    /// scalar value rendered as a string. Non-scalar or missing paths are None.
    pub fn field(&self, path: &str) -> Option<String> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        match head {
            "metadata" => match rest? {
                "name" => Some(self.meta.name.clone()),
                "namespace" => Some(self.meta.namespace.clone()),
                "uid" => Some(self.meta.uid.clone()),
                "resourceVersion" => Some(self.meta.resource_version.clone()),
                other => other
                    .strip_prefix("labels.")
                    .and_then(|k| self.meta.labels.get(k).cloned()),
            },
            "spec" => scalar_at(&self.spec, rest?),
            "status" => scalar_at(&self.status, rest?),
            _ => None,
        }
    }
}

fn scalar_at(value: &Value, path: &str) -> Option<String> {
    let mut cur = value;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    match cur {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Build the canonical key for a namespace and name.
pub fn key_for(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a key into `(namespace, name)`. A leading control marker
/// (`_<letter><space>`) is tolerated and stripped.
pub fn key_parse(key: &str) -> (String, String) {
    let key = match key.split_once(' ') {
        Some((marker, rest)) if marker.starts_with('_') => rest,
        _ => key,
    };
    match key.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    }
}
