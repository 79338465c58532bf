//! Save-on-change.
//!
//! Contract: comparing the pre-chain snapshot with the post-chain object,
//! a labels/finalizers/spec difference issues `update`, a status difference
//! issues `update_status`, and an identical object issues nothing. Both
//! writes can happen for one reconcile. Conflicts propagate to the error
//! callback; redelivery comes from the informer or the gate, never from a
//! direct requeue here.

use rudder_core::Obj;
use tracing::debug;

use crate::request::Request;

/// Persists whatever the handler chain observably changed and returns the
/// stored view, or the unchanged object when no write was needed.
pub(crate) async fn save(unmodified: Option<&Obj>, req: &mut Request) -> anyhow::Result<Option<Obj>> {
    let (Some(old), Some(new_obj)) = (unmodified, req.object.as_ref()) else {
        return Ok(req.object.clone());
    };

    let spec_changed = old.spec != new_obj.spec
        || old.meta.labels != new_obj.meta.labels
        || old.meta.finalizers != new_obj.meta.finalizers;
    let status_changed = old.status != new_obj.status;

    let mut result = new_obj.clone();
    if spec_changed {
        debug!(kind = %result.meta.kind, key = %result.key(), "saving spec change");
        result = req.client.update(&result).await?;
    }
    if status_changed {
        debug!(kind = %result.meta.kind, key = %result.key(), "saving status change");
        result.status = new_obj.status.clone();
        result = req.client.update_status(&result).await?;
    }
    Ok(Some(result))
}
