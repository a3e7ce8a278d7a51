//! Deferred redaction checks.

use concord_auth::redaction_allowed_against_target;
use concord_core::EventView;
use concord_store::EventStore;

use crate::error::Result;

/// Whether a redaction may apply to its target, or `None` while the target
/// is unknown.
pub async fn check_redaction_target<S, E>(store: &S, redaction: &E) -> Result<Option<bool>>
where
    S: EventStore + ?Sized,
    E: EventView + ?Sized,
{
    let Some(target_id) = redaction.redacts() else {
        return Ok(None);
    };
    let Some(target) = store.get_event(target_id).await? else {
        return Ok(None);
    };
    Ok(Some(redaction_allowed_against_target(redaction, &target)))
}
