// ============================
// crates/backend-lib/src/rooms.rs
// ============================
//! Room lifecycle: collision-free code allocation and existence lookup.
//!
//! Teardown of an empty room happens on the leave path
//! (see [`crate::membership::leave_room`]), inside the same transaction
//! that removes the final member.

use crate::error::AppError;
use crate::model::{
    info_doc, location_doc, member_doc, new_id, LocationDoc, MemberDoc, RoomInfoDoc,
};
use crate::store::Store;
use metrics::counter;
use rand::Rng;
use rendezvous_common::{LatLng, ProposalMap};
use tracing::{debug, info};

/// Room codes are this many symbols long.
pub const ROOM_CODE_LEN: usize = 4;

/// Case-sensitive, 62-symbol code alphabet.
pub const ROOM_CODE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Code collisions are retried at most this many times; exhaustion is a
/// reported error, never an unbounded retry loop.
pub const MAX_CODE_ATTEMPTS: u32 = 10;

/// Generate one candidate room code.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Check the shape of a client-supplied room code.
pub fn validate_code(code: &str) -> Result<(), AppError> {
    let well_formed = code.len() == ROOM_CODE_LEN
        && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(AppError::InvalidRoomCode(code.to_string()))
    }
}

/// Create a room and its first member.
///
/// The code's freedom is proven and consumed by the same transaction
/// that writes the info record, the member record, and the initial
/// location, so no concurrent caller can claim the code in between.
pub async fn create_room<S: Store>(
    store: &S,
    point: LatLng,
    now: i64,
) -> Result<(String, String), AppError> {
    create_room_with(store, point, now, generate_code).await
}

/// [`create_room`] with an injectable code generator.
pub async fn create_room_with<S, G>(
    store: &S,
    point: LatLng,
    now: i64,
    mut next_code: G,
) -> Result<(String, String), AppError>
where
    S: Store,
    G: FnMut() -> String,
{
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = next_code();
        let member_id = new_id();
        let sample_id = new_id();

        let claimed = store
            .transaction(|txn| {
                if txn.get(&info_doc(&code)).is_some() {
                    return Ok::<_, AppError>(false);
                }
                txn.set(
                    &info_doc(&code),
                    serde_json::to_value(RoomInfoDoc {
                        created_at: now,
                        proposals: ProposalMap::new(),
                    })?,
                );
                txn.set(
                    &member_doc(&code, &member_id),
                    serde_json::to_value(MemberDoc {
                        joined_at: now,
                        lost: false,
                    })?,
                );
                txn.set(
                    &location_doc(&code, &member_id, &sample_id),
                    serde_json::to_value(LocationDoc {
                        lat: point.lat,
                        lng: point.lng,
                        time: now,
                    })?,
                );
                Ok(true)
            })
            .await?;

        if claimed {
            counter!("room.created").increment(1);
            info!(room_id = %code, user_id = %member_id, "room created");
            return Ok((code, member_id));
        }
        debug!(room_id = %code, attempt, "room code collision, regenerating");
    }

    counter!("room.allocation_exhausted").increment(1);
    Err(AppError::RoomAllocationExhausted {
        attempts: MAX_CODE_ATTEMPTS,
    })
}

/// Look up a room's info record.
pub async fn get_room<S: Store>(store: &S, room_id: &str) -> Result<RoomInfoDoc, AppError> {
    let value = store
        .get(&info_doc(room_id))
        .await?
        .ok_or(AppError::RoomNotFound)?;
    Ok(serde_json::from_value(value)?)
}
