//! Application callbacks

use crate::domain::call::CallUpdate;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

/// Receives call progress for every dialog
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn on_call(&self, update: CallUpdate);
}

/// Receives registration liveness changes
#[async_trait]
pub trait RegistrationHandler: Send + Sync {
    async fn on_registration(&self, registered: bool);
}

#[async_trait]
impl CallHandler for mpsc::UnboundedSender<CallUpdate> {
    async fn on_call(&self, update: CallUpdate) {
        if self.send(update).is_err() {
            warn!("Call update dropped: receiver closed");
        }
    }
}

#[async_trait]
impl RegistrationHandler for mpsc::UnboundedSender<bool> {
    async fn on_registration(&self, registered: bool) {
        if self.send(registered).is_err() {
            warn!("Registration update dropped: receiver closed");
        }
    }
}
