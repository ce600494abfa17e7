// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Rendezvous coordination server: ephemeral code-addressed rooms over
//! persistent WebSocket connections, with realtime fan-out of member
//! positions and meeting-point negotiation.
//!
//! Everything consistent happens inside a [`store::Store`] transaction;
//! everything realtime rides the store's change subscriptions. The
//! WebSocket layer in [`ws_router`] is a thin session loop over the
//! operation modules ([`rooms`], [`membership`], [`proposals`]).

pub mod config;
pub mod error;
pub mod fanout;
pub mod geo;
pub mod heartbeat;
pub mod membership;
pub mod model;
pub mod proposals;
pub mod rooms;
pub mod session;
pub mod store;
pub mod ws_router;

use config::Settings;
use std::sync::Arc;

/// Shared application state handed to every connection.
#[derive(Clone)]
pub struct AppState<S: store::Store> {
    pub store: S,
    pub settings: Arc<Settings>,
}

impl<S: store::Store> AppState<S> {
    pub fn new(store: S, settings: Settings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }
}
