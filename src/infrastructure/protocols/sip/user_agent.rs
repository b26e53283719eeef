//! SIP user agent
//!
//! Owns the transport, the receive loop and the registration refresh. Every
//! public operation runs one transaction to completion and returns its typed
//! outcome; call progress that arrives later is reported through the
//! [`CallHandler`].

use super::builder::{OutboundMessage, RequestBuilder};
use super::call_state::{CallEvent, CallState};
use super::context::AgentContext;
use super::counter::random_hex;
use super::dialog::Dialog;
use super::handler::{CallHandler, RegistrationHandler};
use super::hold::HoldController;
use super::invite::{InviteController, InviteOutcome};
use super::message::SipError;
use super::messaging::MessageController;
use super::register::{DeregisterController, Registration, RegisterController, SubscribeController};
use super::router;
use super::sdp::SessionDescription;
use super::teardown::{ByeController, CancelController};
use super::transaction;
use super::transfer::{Replaces, TransferController};
use super::transport::{Transport, UdpTransport};
use crate::config::Config;
use crate::domain::call::{CallDirection, CallStatus, MediaDescription, TransmitMode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// CRLF keepalive datagram
const KEEPALIVE: &[u8] = b"\r\n\r\n";

pub struct UserAgentBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    call_handler: Option<Arc<dyn CallHandler>>,
    registration_handler: Option<Arc<dyn RegistrationHandler>>,
}

impl UserAgentBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            call_handler: None,
            registration_handler: None,
        }
    }

    /// Use `transport` instead of binding a UDP socket
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn call_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.call_handler = Some(handler);
        self
    }

    pub fn registration_handler(mut self, handler: Arc<dyn RegistrationHandler>) -> Self {
        self.registration_handler = Some(handler);
        self
    }

    pub async fn build(self) -> Result<UserAgent, SipError> {
        self.config.validate()?;
        let server_addr = resolve(&self.config.server_endpoint()).await?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let bind_addr: SocketAddr = self
                    .config
                    .bind_endpoint()
                    .parse()
                    .map_err(|e| SipError::Config(format!("bind address: {}", e)))?;
                Arc::new(UdpTransport::bind(bind_addr, server_addr).await?)
            }
        };

        let ctx = AgentContext::new(
            self.config,
            transport,
            server_addr,
            self.call_handler,
            self.registration_handler,
        );
        Ok(UserAgent {
            ctx: Arc::new(ctx),
            receive_task: Mutex::new(None),
            refresh_task: Mutex::new(None),
        })
    }
}

async fn resolve(endpoint: &str) -> Result<SocketAddr, SipError> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| SipError::Config(format!("cannot resolve {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| SipError::Config(format!("{} did not resolve", endpoint)))
}

pub struct UserAgent {
    ctx: Arc<AgentContext>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl UserAgent {
    pub fn builder(config: Config) -> UserAgentBuilder {
        UserAgentBuilder::new(config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.transport.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.ctx.server_addr
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Start receiving and register with the server
    pub async fn start(&self) -> Result<Registration, SipError> {
        self.spawn_receive_loop()?;

        match transaction::run(&self.ctx, RegisterController::new(&self.ctx)).await {
            Ok(registration) => {
                self.registered(registration.clone()).await;
                Ok(registration)
            }
            Err(e) => {
                error!("Registration failed: {}", e);
                self.ctx.status.report(false).await;
                Err(e)
            }
        }
    }

    fn spawn_receive_loop(&self) -> Result<(), SipError> {
        let mut slot = self.receive_task.lock();
        if slot.is_some() {
            return Ok(());
        }
        let mut rx = self
            .ctx
            .transport
            .take_receiver()
            .ok_or_else(|| SipError::TransportError("receiver already taken".to_string()))?;

        let ctx = self.ctx.clone();
        *slot = Some(tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                metrics::counter!("sipagent_messages_received_total").increment(1);
                debug!("Received {} from {}", incoming.message, incoming.source);
                if let Some(unclaimed) = ctx.dispatcher.offer(incoming.message) {
                    router::route(&ctx, unclaimed).await;
                }
            }
            if !ctx.is_shutting_down() {
                error!("Transport closed");
                ctx.status.report(false).await;
            }
        }));
        Ok(())
    }

    async fn registered(&self, registration: Registration) {
        *self.ctx.registration.write().await = Some(registration.clone());
        self.ctx.status.report(true).await;
        self.ctx.keepalive.arm();

        let ctx = self.ctx.clone();
        let task = tokio::spawn(refresh_loop(ctx, registration));
        if let Some(previous) = self.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Deregister, unsubscribe and release the transport. The unsubscribe
    /// only follows a successful deregistration; a failed log-off is
    /// returned once the transport has been released.
    pub async fn stop(&self) -> Result<(), SipError> {
        info!("Stopping user agent");
        self.ctx.begin_shutdown();
        self.ctx.keepalive.cancel();
        let refresh = self.refresh_task.lock().take();
        if let Some(task) = refresh {
            task.abort();
            // Wait for the in-flight refresh to drop its subscription
            let _ = task.await;
        }

        let registration = self.ctx.registration.write().await.take();
        let mut outcome = Ok(());
        if let Some(registration) = registration {
            outcome = self.log_off(registration).await;
        }
        self.ctx.status.report(false).await;

        let receiver = self.receive_task.lock().take();
        if let Some(task) = receiver {
            task.abort();
        }
        self.ctx.dialogs.clear().await;
        self.ctx.transport.close().await?;
        outcome
    }

    async fn log_off(&self, registration: Registration) -> Result<(), SipError> {
        if let Err(e) = transaction::run(&self.ctx, DeregisterController::new(registration)).await {
            error!("Deregistration failed: {}", e);
            return Err(e);
        }
        transaction::run(&self.ctx, SubscribeController::unsubscribe(&self.ctx))
            .await
            .map_err(|e| {
                warn!("Unsubscribe failed: {}", e);
                e
            })
    }

    /// Call `number`. Returns once the first provisional or final answer
    /// arrives.
    pub async fn invite(
        &self,
        number: &str,
        media: MediaDescription,
        mode: TransmitMode,
    ) -> Result<InviteOutcome, SipError> {
        let controller = InviteController::new(&self.ctx, number, media, mode);
        transaction::run(&self.ctx, controller).await
    }

    /// Accept a ringing inbound call
    pub async fn answer(
        &self,
        call_id: &str,
        media: MediaDescription,
        mode: TransmitMode,
    ) -> Result<CallState, SipError> {
        let dialog = self.ringing_inbound(call_id).await?;
        let invite = dialog
            .pending_invite
            .as_ref()
            .ok_or_else(|| SipError::Internal(format!("no INVITE stored for {}", call_id)))?;

        let body = SessionDescription::answer(
            &self.ctx.config.agent.user_agent,
            dialog.session_id,
            self.ctx.builder.local_host(),
            &media,
            mode,
            random_hex(16),
        )
        .render();
        let ok = self.ctx.builder.answer(invite, &dialog.local_tag, &body)?;
        self.ctx.send(&ok).await?;

        self.ctx
            .dialogs
            .update(call_id, move |d| {
                d.media = media;
                d.mode = mode;
            })
            .await?;
        let state = self.ctx.dialogs.transition(call_id, CallEvent::Answer).await?;
        self.ctx
            .notify(call_id, CallStatus::Established, invite.clone())
            .await;
        Ok(state)
    }

    /// Refuse a ringing inbound call with 486
    pub async fn busy(&self, call_id: &str) -> Result<(), SipError> {
        let dialog = self.ringing_inbound(call_id).await?;
        let response = self.respond_to_invite(&dialog, |builder, invite| {
            builder.response(invite, 486, Some(&dialog.local_tag))
        })?;
        self.ctx.send(&response).await?;
        self.ctx.dialogs.transition(call_id, CallEvent::Busy).await?;
        Ok(())
    }

    /// Send a ringing inbound call to `target` with 302
    pub async fn redirect(&self, call_id: &str, target: &str) -> Result<(), SipError> {
        let dialog = self.ringing_inbound(call_id).await?;
        let response = self.respond_to_invite(&dialog, |builder, invite| {
            builder.redirect(invite, Some(&dialog.local_tag), target)
        })?;
        self.ctx.send(&response).await?;
        self.ctx.dialogs.transition(call_id, CallEvent::Reject).await?;
        info!("Redirected {} to {}", call_id, target);
        Ok(())
    }

    fn respond_to_invite(
        &self,
        dialog: &Dialog,
        build: impl FnOnce(&RequestBuilder, &super::message::SipMessage) -> Result<OutboundMessage, SipError>,
    ) -> Result<OutboundMessage, SipError> {
        let invite = dialog
            .pending_invite
            .as_ref()
            .ok_or_else(|| SipError::Internal(format!("no INVITE stored for {}", dialog.call_id)))?;
        build(&self.ctx.builder, invite)
    }

    async fn ringing_inbound(&self, call_id: &str) -> Result<Dialog, SipError> {
        let dialog = self
            .ctx
            .dialogs
            .get(call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(call_id.to_string()))?;
        if dialog.direction != CallDirection::Inbound || !dialog.machine.can_answer() {
            return Err(SipError::InvalidStateTransition(format!(
                "{} is {}",
                call_id,
                dialog.state().name()
            )));
        }
        Ok(dialog)
    }

    /// Put an established call on hold, or take it off hold
    pub async fn hold(
        &self,
        call_id: &str,
        hold: bool,
        media: MediaDescription,
        mode: TransmitMode,
    ) -> Result<CallState, SipError> {
        transaction::run(&self.ctx, HoldController::new(call_id, hold, media, mode)).await
    }

    /// Refer the far end of `call_id` to `refer_to`. With `replaces` the new
    /// leg takes over that other call (attended transfer).
    pub async fn transfer(
        &self,
        call_id: &str,
        refer_to: &str,
        replaces: Option<&str>,
    ) -> Result<CallState, SipError> {
        let replaces = match replaces {
            Some(other) => {
                let dialog = self
                    .ctx
                    .dialogs
                    .get(other)
                    .await
                    .ok_or_else(|| SipError::DialogNotFound(other.to_string()))?;
                Some(Replaces::from_dialog(&dialog)?)
            }
            None => None,
        };
        transaction::run(&self.ctx, TransferController::new(call_id, refer_to, replaces)).await
    }

    /// Hang up an established call
    pub async fn bye(&self, call_id: &str) -> Result<(), SipError> {
        transaction::run(&self.ctx, ByeController::new(call_id)).await
    }

    /// Abandon an outbound call that has not been answered
    pub async fn cancel(&self, call_id: &str) -> Result<(), SipError> {
        transaction::run(&self.ctx, CancelController::new(call_id)).await
    }

    pub async fn send_message(&self, number: &str, text: &str) -> Result<(), SipError> {
        transaction::run(&self.ctx, MessageController::new(&self.ctx, number, text)).await
    }

    /// Send a CRLF keepalive to the server
    pub async fn keepalive(&self) -> Result<(), SipError> {
        self.ctx.send_bytes(Bytes::from_static(KEEPALIVE)).await
    }

    pub fn set_do_not_disturb(&self, enabled: bool) {
        info!("Do not disturb {}", if enabled { "on" } else { "off" });
        self.ctx.set_do_not_disturb(enabled);
    }

    pub fn do_not_disturb(&self) -> bool {
        self.ctx.do_not_disturb()
    }

    pub fn is_registered(&self) -> bool {
        self.ctx.status.is_registered()
    }

    pub async fn registration(&self) -> Option<Registration> {
        self.ctx.registration.read().await.clone()
    }

    /// Snapshot of one call
    pub async fn dialog(&self, call_id: &str) -> Option<Dialog> {
        self.ctx.dialogs.get(call_id).await
    }

    pub async fn call_ids(&self) -> Vec<String> {
        self.ctx.dialogs.call_ids().await
    }
}

impl Drop for UserAgent {
    fn drop(&mut self) {
        self.ctx.begin_shutdown();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }
}

/// Re-REGISTER shortly before each registration expires
async fn refresh_loop(ctx: Arc<AgentContext>, mut registration: Registration) {
    loop {
        tokio::time::sleep(registration.refresh_in()).await;
        if ctx.is_shutting_down() {
            return;
        }

        match transaction::run(&ctx, RegisterController::refresh(&registration)).await {
            Ok(refreshed) => {
                debug!("Registration refreshed for {}s", refreshed.expires);
                *ctx.registration.write().await = Some(refreshed.clone());
                ctx.status.report(true).await;
                ctx.keepalive.arm();
                registration = refreshed;
            }
            Err(e) => {
                error!("Registration refresh failed: {}", e);
                ctx.status.report(false).await;
                return;
            }
        }
    }
}
