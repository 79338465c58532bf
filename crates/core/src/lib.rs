//! Rudder core types: kinds, objects, keys, selectors, version ordering.

#![forbid(unsafe_code)]

pub mod kind;
pub mod object;
pub mod selector;
pub mod version;

pub use kind::Kind;
pub use object::{key_for, key_parse, Obj, ObjMeta};
pub use selector::{FieldSelector, LabelSelector};
pub use version::newer;

pub mod prelude {
    pub use super::{key_for, key_parse, newer, FieldSelector, Kind, LabelSelector, Obj, ObjMeta};
}
