// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between the Rendezvous client and server.
//! This module defines the WebSocket protocol messages and supporting types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A latitude/longitude pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// A candidate meeting point authored by one member.
///
/// Keyed by the proposing member's id in the room's proposal map; at
/// most one live proposal exists per proposer (a new proposal
/// overwrites the prior one).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// The proposed meeting point
    pub location: LatLng,
    /// Member ids that have accepted this proposal
    #[serde(default)]
    pub accepted_by: Vec<String>,
}

/// The per-room proposal map, keyed by proposing member id.
pub type ProposalMap = BTreeMap<String, Proposal>;

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientToServer {
    /// Heartbeat response to a server `ping`
    Pong,
    /// Create a new room with the caller's starting position
    Create {
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lng: Option<f64>,
    },
    /// Join an existing room
    /// # Fields
    /// * `room_id` - Code of the room to join
    /// * `lat`/`lng` - Joining member's starting position
    Join {
        room_id: String,
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lng: Option<f64>,
    },
    /// Leave the current room (no-op when not in one)
    Leave,
    /// Report a new position sample
    Location {
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lng: Option<f64>,
    },
    /// Propose a meeting point (overwrites the caller's prior proposal)
    Propose {
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lng: Option<f64>,
    },
    /// Accept the proposal authored by `user_id`
    Accept { user_id: String },
    /// Withdraw acceptance of the proposal authored by `user_id`
    Revoke { user_id: String },
    /// Delete the caller's own proposal
    Clear,
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerToClient {
    /// Heartbeat probe; the client must answer with `pong`
    Ping,
    /// Response to successful room creation
    Created { room_id: String, user_id: String },
    /// Response to successful room join
    Joined { room_id: String, user_id: String },
    /// A member left the room (also sent to the leaver itself)
    Left { user_id: String },
    /// A member's position sample
    Location {
        user_id: String,
        lat: f64,
        lng: f64,
        /// Server-assigned timestamp, epoch milliseconds
        time: i64,
    },
    /// A member appeared or its liveness state changed
    MemberUpdate {
        user_id: String,
        lost: bool,
        joined_at: i64,
    },
    /// The room's shared state changed (proposal map mutation)
    RoomUpdate {
        room_id: String,
        proposals: ProposalMap,
    },
    /// Recoverable error report; the connection stays open
    Error { code: String, message: String },
}
