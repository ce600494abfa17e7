// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket endpoint and the per-connection session loop.
//!
//! One task per connection runs the inbound loop; a companion writer
//! task owns the socket's send half and drains the session's outbound
//! queue, so the fan-out task and the session loop never contend for
//! the socket.

use crate::error::{AppError, Severity};
use crate::fanout;
use crate::geo;
use crate::heartbeat::Heartbeat;
use crate::membership;
use crate::model::{new_id, now_ms, Binding};
use crate::proposals;
use crate::rooms;
use crate::session::Session;
use crate::store::Store;
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rendezvous_common::{ClientToServer, ServerToClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Build the application router.
pub fn create_router<S: Store>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .with_state(state)
}

async fn ws_handler<S: Store>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Outcome of one inbound frame, as seen by the session loop.
enum LoopControl {
    Continue,
    Close,
}

async fn handle_connection<S: Store>(socket: WebSocket, state: Arc<AppState<S>>) {
    let session_id = new_id();
    counter!("ws.connections").increment(1);
    gauge!("ws.active").increment(1.0);
    info!(session_id, "websocket connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerToClient>(64);
    let (close_tx, close_rx) = mpsc::channel::<String>(1);
    let writer = tokio::spawn(write_outbound(ws_tx, out_rx, close_rx));

    let mut session = Session::new(session_id.clone(), out_tx);
    let (mut heartbeat, mut expired_rx) = Heartbeat::new(state.settings.heartbeat_timeout());

    // open the liveness window immediately; the first pong re-arms it
    if session.send(ServerToClient::Ping).await.is_ok() {
        heartbeat.arm();

        loop {
            tokio::select! {
                maybe_frame = ws_rx.next() => {
                    match maybe_frame {
                        Some(Ok(Message::Text(text))) => {
                            let control =
                                dispatch(&state, &mut session, &mut heartbeat, &close_tx, &text)
                                    .await;
                            if matches!(control, LoopControl::Close) {
                                break;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}, // binary and transport ping/pong frames
                        Some(Err(err)) => {
                            debug!(session_id, error = %err, "websocket receive error");
                            break;
                        },
                    }
                },
                _ = expired_rx.recv() => {
                    warn!(session_id, "heartbeat expired, evicting session");
                    counter!("ws.heartbeat_evictions").increment(1);
                    if let Some(binding) = session.binding() {
                        // advisory flag for peers; departure follows on
                        // the shared leave path below
                        if let Err(err) = membership::mark_lost(&state.store, binding).await {
                            warn!(session_id, error = %err, "failed to mark member lost");
                        }
                    }
                    let _ = close_tx.send("heartbeat timeout".to_string()).await;
                    break;
                },
            }
        }
    }

    heartbeat.cancel();
    disconnect(&state, &mut session).await;
    drop(session); // releases the outbound queue so the writer drains and exits
    let _ = writer.await;

    gauge!("ws.active").decrement(1.0);
    info!(session_id, "websocket disconnected");
}

/// Writer task: owns the socket's send half. Serializes queued
/// messages, and on a close request emits a policy-violation close
/// frame and stops.
async fn write_outbound(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerToClient>,
    mut close_rx: mpsc::Receiver<String>,
) {
    loop {
        tokio::select! {
            maybe_message = out_rx.recv() => {
                let Some(message) = maybe_message else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        error!(error = %err, "failed to serialize outbound message");
                        continue;
                    },
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            },
            Some(reason) = close_rx.recv() => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        }
    }
}

/// Parse and run one inbound frame, reporting errors per severity.
async fn dispatch<S: Store>(
    state: &AppState<S>,
    session: &mut Session,
    heartbeat: &mut Heartbeat,
    close_tx: &mpsc::Sender<String>,
    text: &str,
) -> LoopControl {
    let result = match serde_json::from_str::<ClientToServer>(text) {
        Ok(message) => handle_message(state, session, heartbeat, message).await,
        Err(err) => Err(AppError::Json(err)),
    };

    let Err(err) = result else {
        return LoopControl::Continue;
    };

    match err.severity() {
        Severity::Recoverable => {
            debug!(session_id = %session.id, error = %err, "recoverable session error");
            let report = ServerToClient::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            };
            if session.send(report).await.is_err() {
                return LoopControl::Close;
            }
            LoopControl::Continue
        },
        Severity::Fatal => {
            error!(session_id = %session.id, error = %err, "fatal session error");
            let _ = close_tx.send(err.to_string()).await;
            LoopControl::Close
        },
    }
}

async fn handle_message<S: Store>(
    state: &AppState<S>,
    session: &mut Session,
    heartbeat: &mut Heartbeat,
    message: ClientToServer,
) -> Result<(), AppError> {
    match message {
        ClientToServer::Pong => {
            session.send(ServerToClient::Ping).await?;
            heartbeat.arm();
            Ok(())
        },

        ClientToServer::Create { lat, lng } => {
            if session.binding().is_some() {
                return Err(AppError::AlreadyInRoom);
            }
            let point = geo::validate(lat, lng)?;
            let (room_id, member_id) =
                rooms::create_room(&state.store, point, now_ms()).await?;
            enter_room(state, session, room_id.clone(), member_id.clone());
            session
                .send(ServerToClient::Created { room_id, user_id: member_id })
                .await
        },

        ClientToServer::Join { room_id, lat, lng } => {
            if session.binding().is_some() {
                return Err(AppError::AlreadyInRoom);
            }
            rooms::validate_code(&room_id)?;
            let point = geo::validate(lat, lng)?;
            let member_id =
                membership::join_room(&state.store, &room_id, point, now_ms()).await?;
            enter_room(state, session, room_id.clone(), member_id.clone());
            session
                .send(ServerToClient::Joined { room_id, user_id: member_id })
                .await
        },

        // leaving while not in a room is a no-op
        ClientToServer::Leave => match session.binding().cloned() {
            Some(binding) => {
                // fan-out stops before any store mutation, but the
                // binding stays until the teardown commits so a failed
                // leave can be retried
                session.cancel_fanout();
                membership::leave_room(&state.store, &binding, state.settings.delete_batch())
                    .await?;
                session.unbind();
                session
                    .send(ServerToClient::Left { user_id: binding.member_id })
                    .await
            },
            None => Ok(()),
        },

        ClientToServer::Location { lat, lng } => {
            let binding = bound(session)?;
            let point = geo::validate(lat, lng)?;
            membership::record_location(&state.store, &binding, point, now_ms()).await
        },

        ClientToServer::Propose { lat, lng } => {
            let binding = bound(session)?;
            let point = geo::validate(lat, lng)?;
            proposals::propose(&state.store, &binding.room_id, &binding.member_id, point).await
        },

        ClientToServer::Accept { user_id } => {
            let binding = bound(session)?;
            proposals::accept(&state.store, &binding.room_id, &binding.member_id, &user_id).await
        },

        ClientToServer::Revoke { user_id } => {
            let binding = bound(session)?;
            proposals::revoke(&state.store, &binding.room_id, &binding.member_id, &user_id).await
        },

        ClientToServer::Clear => {
            let binding = bound(session)?;
            proposals::clear(&state.store, &binding.room_id, &binding.member_id).await
        },
    }
}

/// Bind the session to its new membership and start its fan-out.
fn enter_room<S: Store>(
    state: &AppState<S>,
    session: &mut Session,
    room_id: String,
    member_id: String,
) {
    let binding = Binding { room_id, member_id };
    let fanout = fanout::spawn(state.store.clone(), binding.clone(), session.outbound());
    session.bind(binding, fanout);
}

fn bound(session: &Session) -> Result<Binding, AppError> {
    session.binding().cloned().ok_or(AppError::NotInRoom)
}

/// Transient store failures during disconnect cleanup are retried this
/// many times before giving up.
const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Shared teardown for every exit path: client leave, socket close,
/// and heartbeat eviction all converge here.
async fn disconnect<S: Store>(state: &AppState<S>, session: &mut Session) {
    session.cancel_fanout();
    let Some(binding) = session.binding().cloned() else {
        return;
    };
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match membership::leave_room(&state.store, &binding, state.settings.delete_batch()).await {
            Ok(()) => {
                session.unbind();
                // best-effort: the socket is usually already gone
                let _ = session
                    .send(ServerToClient::Left {
                        user_id: binding.member_id,
                    })
                    .await;
                return;
            },
            Err(err) if attempt < CLEANUP_ATTEMPTS => {
                warn!(
                    session_id = %session.id,
                    room_id = %binding.room_id,
                    attempt,
                    error = %err,
                    "disconnect cleanup failed, retrying"
                );
                tokio::time::sleep(CLEANUP_BACKOFF).await;
            },
            Err(err) => {
                counter!("ws.cleanup_failures").increment(1);
                error!(
                    session_id = %session.id,
                    room_id = %binding.room_id,
                    error = %err,
                    "failed to clean up membership on disconnect"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::model::{info_doc, member_doc};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        state: Arc<AppState<MemoryStore>>,
        session: Session,
        heartbeat: Heartbeat,
        out_rx: mpsc::Receiver<ServerToClient>,
    }

    fn harness() -> Harness {
        let state = Arc::new(AppState::new(MemoryStore::new(), Settings::default()));
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = Session::new("test".to_string(), out_tx);
        let (heartbeat, _expired) = Heartbeat::new(Duration::from_secs(30));
        Harness {
            state,
            session,
            heartbeat,
            out_rx,
        }
    }

    impl Harness {
        async fn handle(&mut self, message: ClientToServer) -> Result<(), AppError> {
            handle_message(&self.state, &mut self.session, &mut self.heartbeat, message).await
        }

        async fn recv(&mut self) -> ServerToClient {
            timeout(Duration::from_secs(1), self.out_rx.recv())
                .await
                .expect("message within deadline")
                .expect("channel open")
        }
    }

    #[tokio::test]
    async fn test_create_binds_session_and_replies() {
        let mut h = harness();
        h.handle(ClientToServer::Create {
            lat: Some(1.0),
            lng: Some(2.0),
        })
        .await
        .unwrap();

        let reply = h.recv().await;
        let ServerToClient::Created { room_id, user_id } = reply else {
            panic!("Wrong reply: {reply:?}");
        };
        assert_eq!(h.session.binding().unwrap().room_id, room_id);
        assert_eq!(h.session.binding().unwrap().member_id, user_id);
        assert!(h
            .state
            .store
            .get(&info_doc(&room_id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_create_while_bound_is_rejected() {
        let mut h = harness();
        h.handle(ClientToServer::Create {
            lat: Some(0.0),
            lng: Some(0.0),
        })
        .await
        .unwrap();

        let err = h
            .handle(ClientToServer::Create {
                lat: Some(0.0),
                lng: Some(0.0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyInRoom));
    }

    #[tokio::test]
    async fn test_join_validates_code_shape_before_the_store() {
        let mut h = harness();
        let err = h
            .handle(ClientToServer::Join {
                room_id: "toolong".to_string(),
                lat: Some(0.0),
                lng: Some(0.0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRoomCode(_)));

        let err = h
            .handle(ClientToServer::Join {
                room_id: "aaaa".to_string(),
                lat: Some(0.0),
                lng: Some(0.0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RoomNotFound));
        assert!(h.session.binding().is_none());
    }

    #[tokio::test]
    async fn test_location_requires_membership() {
        let mut h = harness();
        let err = h
            .handle(ClientToServer::Location {
                lat: Some(0.0),
                lng: Some(0.0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotInRoom));
    }

    #[tokio::test]
    async fn test_missing_coordinates_are_rejected_before_any_write() {
        let mut h = harness();
        let err = h
            .handle(ClientToServer::Create {
                lat: None,
                lng: Some(0.0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingCoordinate));
        assert!(h.session.binding().is_none());
    }

    #[tokio::test]
    async fn test_leave_unbinds_and_cleans_the_store() {
        let mut h = harness();
        h.handle(ClientToServer::Create {
            lat: Some(0.0),
            lng: Some(0.0),
        })
        .await
        .unwrap();
        let ServerToClient::Created { room_id, user_id } = h.recv().await else {
            panic!("expected created");
        };

        h.handle(ClientToServer::Leave).await.unwrap();
        let left = wait_for_left(&mut h).await;
        assert_eq!(left, user_id);

        assert!(h.session.binding().is_none());
        assert!(h
            .state
            .store
            .get(&member_doc(&room_id, &user_id))
            .await
            .unwrap()
            .is_none());
        // sole member left, so the room itself is gone
        assert!(h
            .state
            .store
            .get(&info_doc(&room_id))
            .await
            .unwrap()
            .is_none());

        // a second leave is a silent no-op
        h.handle(ClientToServer::Leave).await.unwrap();
    }

    async fn wait_for_left(h: &mut Harness) -> String {
        loop {
            if let ServerToClient::Left { user_id } = h.recv().await {
                return user_id;
            }
        }
    }

    #[tokio::test]
    async fn test_pong_answers_with_ping() {
        let mut h = harness();
        h.handle(ClientToServer::Pong).await.unwrap();
        assert_eq!(h.recv().await, ServerToClient::Ping);
    }

    #[tokio::test]
    async fn test_proposal_flow_requires_membership() {
        let mut h = harness();
        let err = h
            .handle(ClientToServer::Accept {
                user_id: "m1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotInRoom));

        h.handle(ClientToServer::Create {
            lat: Some(0.0),
            lng: Some(0.0),
        })
        .await
        .unwrap();

        h.handle(ClientToServer::Propose {
            lat: Some(5.0),
            lng: Some(6.0),
        })
        .await
        .unwrap();

        let binding = h.session.binding().unwrap().clone();
        let info = crate::rooms::get_room(&h.state.store, &binding.room_id)
            .await
            .unwrap();
        assert_eq!(
            info.proposals[&binding.member_id].location,
            rendezvous_common::LatLng { lat: 5.0, lng: 6.0 }
        );
    }

    use crate::store::{SnapshotMode, StoreError, Subscription, Txn};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Delegates to a [`MemoryStore`] but fails the next N transactions,
    /// for exercising teardown under transient store outages.
    #[derive(Clone)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: Arc<AtomicU32>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: Arc::new(AtomicU32::new(0)),
            }
        }

        fn fail_next(&self, count: u32) {
            self.failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Store for FlakyStore {
        async fn get(&self, doc: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(doc).await
        }

        async fn list(
            &self,
            collection: &str,
            limit: usize,
        ) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.list(collection, limit).await
        }

        async fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
        where
            F: FnOnce(&mut Txn<'_>) -> Result<T, E> + Send,
            T: Send,
            E: From<StoreError> + Send,
        {
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(E::from(StoreError::Unavailable(
                    "injected outage".to_string(),
                )));
            }
            self.inner.transaction(op).await
        }

        fn subscribe(&self, collection: &str, mode: SnapshotMode) -> Subscription {
            self.inner.subscribe(collection, mode)
        }
    }

    struct FlakyHarness {
        state: Arc<AppState<FlakyStore>>,
        session: Session,
        heartbeat: Heartbeat,
        _out_rx: mpsc::Receiver<ServerToClient>,
    }

    fn flaky_harness() -> FlakyHarness {
        let state = Arc::new(AppState::new(FlakyStore::new(), Settings::default()));
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = Session::new("test".to_string(), out_tx);
        let (heartbeat, _expired) = Heartbeat::new(Duration::from_secs(30));
        FlakyHarness {
            state,
            session,
            heartbeat,
            _out_rx: out_rx,
        }
    }

    impl FlakyHarness {
        async fn handle(&mut self, message: ClientToServer) -> Result<(), AppError> {
            handle_message(&self.state, &mut self.session, &mut self.heartbeat, message).await
        }
    }

    #[tokio::test]
    async fn test_failed_leave_keeps_binding_for_retry() {
        let mut h = flaky_harness();
        h.handle(ClientToServer::Create {
            lat: Some(0.0),
            lng: Some(0.0),
        })
        .await
        .unwrap();
        let binding = h.session.binding().unwrap().clone();

        h.state.store.fail_next(1);
        let err = h.handle(ClientToServer::Leave).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));

        // the membership survives the failed teardown, so a retried
        // leave can still finish it
        assert_eq!(h.session.binding(), Some(&binding));
        assert!(h
            .state
            .store
            .get(&member_doc(&binding.room_id, &binding.member_id))
            .await
            .unwrap()
            .is_some());

        h.handle(ClientToServer::Leave).await.unwrap();
        assert!(h.session.binding().is_none());
        assert!(h
            .state
            .store
            .get(&info_doc(&binding.room_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_disconnect_retries_transient_store_failures() {
        let mut h = flaky_harness();
        h.handle(ClientToServer::Create {
            lat: Some(0.0),
            lng: Some(0.0),
        })
        .await
        .unwrap();
        let binding = h.session.binding().unwrap().clone();

        h.state.store.fail_next(1);
        disconnect(&h.state, &mut h.session).await;

        assert!(h.session.binding().is_none());
        assert!(h
            .state
            .store
            .get(&member_doc(&binding.room_id, &binding.member_id))
            .await
            .unwrap()
            .is_none());
        assert!(h
            .state
            .store
            .get(&info_doc(&binding.room_id))
            .await
            .unwrap()
            .is_none());
    }
}
