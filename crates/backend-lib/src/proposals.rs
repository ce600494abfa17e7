// ============================
// crates/backend-lib/src/proposals.rs
// ============================
//! Meeting-point proposal negotiation.
//!
//! All four operations are single transactions over the room's info
//! record. Acceptance targets are identified by proposer id, so accept
//! and revoke of a proposal that no longer exists are silent no-ops:
//! the proposer may have cleared it a moment earlier, and the caller's
//! view simply has not caught up yet. A no-op stages no write, so no
//! spurious room update reaches subscribers.

use crate::error::AppError;
use crate::model::{info_doc, RoomInfoDoc};
use crate::store::Store;
use rendezvous_common::{LatLng, Proposal};
use tracing::debug;

/// Publish (or replace) the proposer's meeting point. Acceptance starts
/// empty even when overwriting an accepted proposal: a moved point is a
/// new question.
pub async fn propose<S: Store>(
    store: &S,
    room_id: &str,
    proposer_id: &str,
    point: LatLng,
) -> Result<(), AppError> {
    mutate_info(store, room_id, |info| {
        info.proposals.insert(
            proposer_id.to_string(),
            Proposal {
                location: point,
                accepted_by: Vec::new(),
            },
        );
        true
    })
    .await?;
    debug!(room_id, user_id = proposer_id, "proposal published");
    Ok(())
}

/// Record the caller's acceptance of the proposal authored by
/// `proposer_id`. Idempotent; missing proposal is a silent no-op.
pub async fn accept<S: Store>(
    store: &S,
    room_id: &str,
    member_id: &str,
    proposer_id: &str,
) -> Result<(), AppError> {
    mutate_info(store, room_id, |info| {
        let Some(proposal) = info.proposals.get_mut(proposer_id) else {
            return false;
        };
        if proposal.accepted_by.iter().any(|id| id == member_id) {
            return false;
        }
        proposal.accepted_by.push(member_id.to_string());
        true
    })
    .await
}

/// Withdraw the caller's acceptance. Idempotent; missing proposal or
/// absent acceptance is a silent no-op.
pub async fn revoke<S: Store>(
    store: &S,
    room_id: &str,
    member_id: &str,
    proposer_id: &str,
) -> Result<(), AppError> {
    mutate_info(store, room_id, |info| {
        let Some(proposal) = info.proposals.get_mut(proposer_id) else {
            return false;
        };
        let before = proposal.accepted_by.len();
        proposal.accepted_by.retain(|id| id != member_id);
        proposal.accepted_by.len() != before
    })
    .await
}

/// Delete the caller's own proposal, acceptances included. Missing
/// proposal is a silent no-op.
pub async fn clear<S: Store>(
    store: &S,
    room_id: &str,
    proposer_id: &str,
) -> Result<(), AppError> {
    mutate_info(store, room_id, |info| {
        info.proposals.remove(proposer_id).is_some()
    })
    .await
}

/// Read-modify-write the info record. The mutator returns whether it
/// changed anything; an unchanged record stages no write at all.
async fn mutate_info<S, M>(store: &S, room_id: &str, mutate: M) -> Result<(), AppError>
where
    S: Store,
    M: FnOnce(&mut RoomInfoDoc) -> bool + Send,
{
    store
        .transaction(|txn| {
            let doc = info_doc(room_id);
            let Some(value) = txn.get(&doc) else {
                return Err(AppError::RoomNotFound);
            };
            let mut info: RoomInfoDoc = serde_json::from_value(value)?;
            if mutate(&mut info) {
                txn.set(&doc, serde_json::to_value(info)?);
            }
            Ok(())
        })
        .await
}
