// ============================
// crates/backend-lib/src/membership.rs
// ============================
//! Membership coordination: transactional join and leave, liveness
//! marking, and location appends.
//!
//! Cross-session consistency rests entirely on the store's transaction
//! boundary. Work done outside a transaction (the paginated location
//! purge) is idempotent and re-validated by the final transaction.

use crate::error::AppError;
use crate::model::{
    info_doc, location_collection, location_doc, member_doc, new_id, room_collection, Binding,
    LocationDoc, MemberDoc, INFO_DOC_ID,
};
use crate::store::Store;
use metrics::counter;
use rendezvous_common::LatLng;
use tracing::{debug, info, warn};

/// Join an existing room.
///
/// Room existence is re-validated inside the same transaction that
/// creates the member and its first location, so a room torn down
/// concurrently can never gain a member. On error nothing is committed
/// and the caller's session must stay unbound.
pub async fn join_room<S: Store>(
    store: &S,
    room_id: &str,
    point: LatLng,
    now: i64,
) -> Result<String, AppError> {
    let member_id = new_id();
    let sample_id = new_id();

    store
        .transaction(|txn| {
            if txn.get(&info_doc(room_id)).is_none() {
                return Err(AppError::RoomNotFound);
            }
            txn.set(
                &member_doc(room_id, &member_id),
                serde_json::to_value(MemberDoc {
                    joined_at: now,
                    lost: false,
                })?,
            );
            txn.set(
                &location_doc(room_id, &member_id, &sample_id),
                serde_json::to_value(LocationDoc {
                    lat: point.lat,
                    lng: point.lng,
                    time: now,
                })?,
            );
            Ok(())
        })
        .await?;

    counter!("member.joined").increment(1);
    info!(room_id, user_id = %member_id, "member joined");
    Ok(member_id)
}

/// Remove a member and everything it owns.
///
/// The location history is purged first in bounded batches (each its
/// own transaction); the final transaction re-sweeps stragglers,
/// deletes the member record, and tears the room down when this was
/// the last member. Emptiness is a live count of member records taken
/// inside that same transaction, so a concurrent join can never be
/// mistaken for an empty room.
pub async fn leave_room<S: Store>(
    store: &S,
    binding: &Binding,
    batch_size: usize,
) -> Result<(), AppError> {
    let batch_size = batch_size.clamp(1, 500);
    let samples = location_collection(&binding.room_id, &binding.member_id);

    loop {
        let deleted = store
            .transaction(|txn| {
                let batch = txn.list(&samples, batch_size);
                for (sample_id, _) in &batch {
                    txn.delete(&location_doc(&binding.room_id, &binding.member_id, sample_id));
                }
                Ok::<_, AppError>(batch.len())
            })
            .await?;
        if deleted < batch_size {
            break;
        }
    }

    let room_deleted = store
        .transaction(|txn| {
            // stragglers written since the purge above
            for (sample_id, _) in txn.list(&samples, batch_size) {
                txn.delete(&location_doc(&binding.room_id, &binding.member_id, &sample_id));
            }
            txn.delete(&member_doc(&binding.room_id, &binding.member_id));

            let remaining = txn
                .list(&room_collection(&binding.room_id), usize::MAX)
                .into_iter()
                .filter(|(id, _)| id != INFO_DOC_ID)
                .count();
            if remaining == 0 {
                txn.delete(&info_doc(&binding.room_id));
            }
            Ok::<_, AppError>(remaining == 0)
        })
        .await?;

    counter!("member.left").increment(1);
    if room_deleted {
        counter!("room.deleted").increment(1);
        info!(room_id = %binding.room_id, "room torn down with last member");
    }
    debug!(room_id = %binding.room_id, user_id = %binding.member_id, "member left");
    Ok(())
}

/// Mark a member lost ahead of eviction, advisory and best-effort: the
/// member may already be gone, which is success, not an error.
pub async fn mark_lost<S: Store>(store: &S, binding: &Binding) -> Result<(), AppError> {
    let marked = store
        .transaction(|txn| {
            let doc = member_doc(&binding.room_id, &binding.member_id);
            let Some(value) = txn.get(&doc) else {
                return Ok::<_, AppError>(false);
            };
            let mut member: MemberDoc = serde_json::from_value(value)?;
            member.lost = true;
            txn.set(&doc, serde_json::to_value(member)?);
            Ok(true)
        })
        .await?;

    if marked {
        warn!(room_id = %binding.room_id, user_id = %binding.member_id, "member marked lost");
    }
    Ok(())
}

/// Append one location sample with a server-assigned timestamp.
pub async fn record_location<S: Store>(
    store: &S,
    binding: &Binding,
    point: LatLng,
    now: i64,
) -> Result<(), AppError> {
    let sample_id = new_id();
    store
        .transaction(|txn| {
            txn.set(
                &location_doc(&binding.room_id, &binding.member_id, &sample_id),
                serde_json::to_value(LocationDoc {
                    lat: point.lat,
                    lng: point.lng,
                    time: now,
                })?,
            );
            Ok::<_, AppError>(())
        })
        .await
}
