// ============================
// crates/backend-lib/src/session.rs
// ============================
//! Per-connection session state.
//!
//! A session is bound to at most one room at a time. Binding couples
//! the room membership with the fan-out task that feeds this
//! connection; unbinding tears the fan-out down before the membership
//! records go away, so the session never observes its own departure
//! through the subscription path.

use crate::error::AppError;
use crate::fanout::FanoutHandle;
use crate::model::Binding;
use rendezvous_common::ServerToClient;
use tokio::sync::mpsc;

pub struct Session {
    /// Connection id, for log correlation only
    pub id: String,
    outbound: mpsc::Sender<ServerToClient>,
    binding: Option<Binding>,
    fanout: Option<FanoutHandle>,
}

impl Session {
    pub fn new(id: String, outbound: mpsc::Sender<ServerToClient>) -> Self {
        Self {
            id,
            outbound,
            binding: None,
            fanout: None,
        }
    }

    /// Queue a message for this connection.
    pub async fn send(&self, message: ServerToClient) -> Result<(), AppError> {
        self.outbound.send(message).await?;
        Ok(())
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Clone of the outbound queue, for wiring up the fan-out task.
    pub fn outbound(&self) -> mpsc::Sender<ServerToClient> {
        self.outbound.clone()
    }

    /// Enter a room: remember the membership and attach its fan-out.
    pub fn bind(&mut self, binding: Binding, fanout: FanoutHandle) {
        self.binding = Some(binding);
        self.fanout = Some(fanout);
    }

    /// Stop the fan-out without giving up the membership. Used when the
    /// store-side teardown may still fail: the binding must survive so
    /// the teardown can be retried.
    pub fn cancel_fanout(&mut self) {
        if let Some(fanout) = self.fanout.take() {
            fanout.cancel();
        }
    }

    /// Leave the bound room, stopping the fan-out first. Returns the
    /// membership so the caller can finish the teardown in the store.
    pub fn unbind(&mut self) -> Option<Binding> {
        self.cancel_fanout();
        self.binding.take()
    }
}
