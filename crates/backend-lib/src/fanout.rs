// ============================
// crates/backend-lib/src/fanout.rs
// ============================
//! Realtime fan-out: one task per bound session that projects store
//! change events onto the connection's outbound queue.
//!
//! The roster subscription (info record plus member records) drives
//! everything. Each peer discovered there gets its own child task
//! streaming that peer's location samples; the child dies with the
//! peer entry, and every child dies with the fan-out task itself.

use crate::model::{
    location_collection, room_collection, Binding, LocationDoc, MemberDoc, RoomInfoDoc,
    INFO_DOC_ID,
};
use crate::store::{ChangeKind, SnapshotMode, Store};
use rendezvous_common::ServerToClient;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owning handle to a session's fan-out task. Dropping or cancelling it
/// aborts the task, which in turn drops every subscription and child
/// task it holds.
pub struct FanoutHandle {
    task: JoinHandle<()>,
}

impl FanoutHandle {
    pub(crate) fn from_task(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for FanoutHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Child-task guard: aborts on drop so removing a peer entry (or
/// aborting the parent) cannot leak a location watcher.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PeerState {
    lost: bool,
    _locations: AbortOnDrop,
}

/// Start the fan-out for one bound session.
pub fn spawn<S: Store>(
    store: S,
    binding: Binding,
    outbound: mpsc::Sender<ServerToClient>,
) -> FanoutHandle {
    FanoutHandle::from_task(tokio::spawn(run(store, binding, outbound)))
}

async fn run<S: Store>(store: S, binding: Binding, outbound: mpsc::Sender<ServerToClient>) {
    let mut roster = store.subscribe(&room_collection(&binding.room_id), SnapshotMode::Initial);
    let mut peers: HashMap<String, PeerState> = HashMap::new();

    while let Some(event) = roster.next().await {
        let result = if event.doc_id == INFO_DOC_ID {
            handle_info(&binding, event.kind, event.data, &outbound).await
        } else if event.doc_id == binding.member_id {
            // the session's own membership; replies and the leave path
            // already cover it
            Ok(())
        } else {
            handle_peer(&store, &binding, event, &mut peers, &outbound).await
        };

        match result {
            Ok(()) => {},
            // outbound closed: the connection is gone, stop quietly
            Err(FanoutError::Disconnected) => break,
            Err(FanoutError::BadDocument(err)) => {
                warn!(
                    room_id = %binding.room_id,
                    user_id = %binding.member_id,
                    error = %err,
                    "skipping malformed roster document"
                );
            },
        }
    }

    debug!(
        room_id = %binding.room_id,
        user_id = %binding.member_id,
        "fan-out stream ended"
    );
}

enum FanoutError {
    Disconnected,
    BadDocument(serde_json::Error),
}

impl From<serde_json::Error> for FanoutError {
    fn from(err: serde_json::Error) -> Self {
        FanoutError::BadDocument(err)
    }
}

impl<T> From<mpsc::error::SendError<T>> for FanoutError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        FanoutError::Disconnected
    }
}

async fn handle_info(
    binding: &Binding,
    kind: ChangeKind,
    data: serde_json::Value,
    outbound: &mpsc::Sender<ServerToClient>,
) -> Result<(), FanoutError> {
    // a removed info record means the room is being torn down; the
    // member's own removal is what ends this session's view
    if kind == ChangeKind::Removed {
        return Ok(());
    }
    let info: RoomInfoDoc = serde_json::from_value(data)?;
    outbound
        .send(ServerToClient::RoomUpdate {
            room_id: binding.room_id.clone(),
            proposals: info.proposals,
        })
        .await?;
    Ok(())
}

async fn handle_peer<S: Store>(
    store: &S,
    binding: &Binding,
    event: crate::store::ChangeEvent,
    peers: &mut HashMap<String, PeerState>,
    outbound: &mpsc::Sender<ServerToClient>,
) -> Result<(), FanoutError> {
    let peer_id = event.doc_id;
    match event.kind {
        ChangeKind::Added => {
            let member: MemberDoc = serde_json::from_value(event.data)?;
            outbound
                .send(ServerToClient::MemberUpdate {
                    user_id: peer_id.clone(),
                    lost: member.lost,
                    joined_at: member.joined_at,
                })
                .await?;
            let locations = follow_locations(store, binding, &peer_id, outbound.clone());
            peers.insert(
                peer_id,
                PeerState {
                    lost: member.lost,
                    _locations: AbortOnDrop(locations),
                },
            );
        },
        ChangeKind::Modified => {
            let member: MemberDoc = serde_json::from_value(event.data)?;
            let changed = match peers.get_mut(&peer_id) {
                Some(state) if state.lost != member.lost => {
                    state.lost = member.lost;
                    true
                },
                Some(_) => false,
                // modification raced ahead of the Added replay
                None => true,
            };
            if changed {
                outbound
                    .send(ServerToClient::MemberUpdate {
                        user_id: peer_id,
                        lost: member.lost,
                        joined_at: member.joined_at,
                    })
                    .await?;
            }
        },
        ChangeKind::Removed => {
            peers.remove(&peer_id);
            outbound
                .send(ServerToClient::Left { user_id: peer_id })
                .await?;
        },
    }
    Ok(())
}

/// Spawn the child task that streams one peer's location samples.
///
/// The live subscription is opened before the latest-sample fetch, so
/// nothing written in between is missed; the fetched sample's id is
/// then used to drop its duplicate from the stream.
fn follow_locations<S: Store>(
    store: &S,
    binding: &Binding,
    peer_id: &str,
    outbound: mpsc::Sender<ServerToClient>,
) -> JoinHandle<()> {
    let store = store.clone();
    let collection = location_collection(&binding.room_id, peer_id);
    let peer_id = peer_id.to_string();

    tokio::spawn(async move {
        let mut samples = store.subscribe(&collection, SnapshotMode::ChangesOnly);

        let mut replayed_id = None;
        match store.list(&collection, usize::MAX).await {
            Ok(existing) => {
                let latest = existing.into_iter().filter_map(|(id, data)| {
                    let doc: LocationDoc = serde_json::from_value(data).ok()?;
                    Some((id, doc))
                });
                if let Some((id, doc)) = latest.max_by_key(|(_, doc)| doc.time) {
                    let sent = outbound
                        .send(ServerToClient::Location {
                            user_id: peer_id.clone(),
                            lat: doc.lat,
                            lng: doc.lng,
                            time: doc.time,
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                    replayed_id = Some(id);
                }
            },
            Err(err) => {
                warn!(user_id = %peer_id, error = %err, "latest-location fetch failed");
            },
        }

        while let Some(event) = samples.next().await {
            if event.kind != ChangeKind::Added {
                continue;
            }
            if replayed_id.as_deref() == Some(event.doc_id.as_str()) {
                replayed_id = None;
                continue;
            }
            let Ok(doc) = serde_json::from_value::<LocationDoc>(event.data) else {
                continue;
            };
            let sent = outbound
                .send(ServerToClient::Location {
                    user_id: peer_id.clone(),
                    lat: doc.lat,
                    lng: doc.lng,
                    time: doc.time,
                })
                .await;
            if sent.is_err() {
                return;
            }
        }
    })
}
