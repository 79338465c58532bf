//! Label and field selectors.
//!
//! An empty selector matches everything; selectors are plain data so they can
//! be hashed and compared inside the trigger subscription table.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::Obj;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub op: Op,
    pub values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let found = labels.get(&self.key);
        match self.op {
            Op::In => found.is_some_and(|v| self.values.iter().any(|w| w == v)),
            Op::NotIn => !found.is_some_and(|v| self.values.iter().any(|w| w == v)),
            Op::Exists => found.is_some(),
            Op::DoesNotExist => found.is_none(),
        }
    }
}

/// Conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and_eq(key, value)
    }

    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(Requirement {
            key: key.into(),
            op: Op::In,
            values: vec![value.into()],
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for r in &self.requirements {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match r.op {
                Op::In if r.values.len() == 1 => write!(f, "{}={}", r.key, r.values[0])?,
                Op::In => write!(f, "{} in ({})", r.key, r.values.join(","))?,
                Op::NotIn if r.values.len() == 1 => write!(f, "{}!={}", r.key, r.values[0])?,
                Op::NotIn => write!(f, "{} notin ({})", r.key, r.values.join(","))?,
                Op::Exists => write!(f, "{}", r.key)?,
                Op::DoesNotExist => write!(f, "!{}", r.key)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("invalid selector term: {0}")]
pub struct ParseSelectorError(pub String);

impl FromStr for LabelSelector {
    type Err = ParseSelectorError;

    /// Parses the equality subset: `k=v`, `k!=v`, `k`, `!k`, comma-joined.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sel = LabelSelector::default();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement { key: k.trim().into(), op: Op::NotIn, values: vec![v.trim().into()] }
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement { key: k.trim().into(), op: Op::In, values: vec![v.trim().into()] }
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement { key: k.trim().into(), op: Op::DoesNotExist, values: vec![] }
            } else {
                Requirement { key: term.into(), op: Op::Exists, values: vec![] }
            };
            if req.key.is_empty() {
                return Err(ParseSelectorError(term.to_string()));
            }
            sel.requirements.push(req);
        }
        Ok(sel)
    }
}

/// One field term: dotted path compared for equality or inequality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldTerm {
    pub path: String,
    pub value: String,
    pub equals: bool,
}

/// Conjunction of field terms matched against an object's field view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSelector {
    pub terms: Vec<FieldTerm>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn eq(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            terms: vec![FieldTerm { path: path.into(), value: value.into(), equals: true }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, obj: &Obj) -> bool {
        self.terms.iter().all(|t| {
            let got = obj.field(&t.path);
            if t.equals {
                got.as_deref() == Some(t.value.as_str())
            } else {
                got.as_deref() != Some(t.value.as_str())
            }
        })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for t in &self.terms {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}{}{}", t.path, if t.equals { "=" } else { "!=" }, t.value)?;
        }
        Ok(())
    }
}
