// ============================
// crates/backend-lib/src/model.rs
// ============================
//! Persisted document records and their store paths.
//!
//! Layout:
//! - `rooms/{code}/info`: shared room info record
//! - `rooms/{code}/{memberId}`: one record per member
//! - `locations/{code}/{memberId}/{sampleId}`: append-only samples
//!
//! The info record is a sibling of the member records so one roster
//! subscription observes both; fan-out must treat `info` as a
//! pseudo-member and filter it from peer handling.

use rendezvous_common::ProposalMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved document id of the shared room info record.
pub const INFO_DOC_ID: &str = "info";

/// The (room, member) pair a live connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub member_id: String,
}

/// Shared per-room record: creation time plus the proposal map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfoDoc {
    pub created_at: i64,
    #[serde(default)]
    pub proposals: ProposalMap,
}

/// One member's identity and liveness state within a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberDoc {
    pub joined_at: i64,
    #[serde(default)]
    pub lost: bool,
}

/// One timestamped coordinate sample belonging to one member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocationDoc {
    pub lat: f64,
    pub lng: f64,
    /// Server-assigned, epoch milliseconds
    pub time: i64,
}

pub fn room_collection(room_id: &str) -> String {
    format!("rooms/{room_id}")
}

pub fn info_doc(room_id: &str) -> String {
    format!("rooms/{room_id}/{INFO_DOC_ID}")
}

pub fn member_doc(room_id: &str, member_id: &str) -> String {
    format!("rooms/{room_id}/{member_id}")
}

pub fn location_collection(room_id: &str, member_id: &str) -> String {
    format!("locations/{room_id}/{member_id}")
}

pub fn location_doc(room_id: &str, member_id: &str, sample_id: &str) -> String {
    format!("locations/{room_id}/{member_id}/{sample_id}")
}

/// Server clock, epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh opaque id for members and location samples. Hyphen-free so it
/// never collides with the reserved `info` id or splits a path.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
