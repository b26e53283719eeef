//! State shared by the facade, the receive loop and every transaction

use super::auth::DigestCalculator;
use super::builder::{OutboundMessage, RequestBuilder};
use super::counter::{IdGenerator, SequenceCounter};
use super::dialog::DialogRegistry;
use super::dispatcher::ResponseDispatcher;
use super::handler::{CallHandler, RegistrationHandler};
use super::keepalive::{KeepaliveMonitor, StatusReporter};
use super::message::{SipError, SipMessage};
use super::register::Registration;
use super::transport::{OutgoingMessage, Transport};
use crate::config::Config;
use crate::domain::call::{CallStatus, CallUpdate};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

pub struct AgentContext {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub server_addr: SocketAddr,
    pub ids: IdGenerator,
    pub register_cseq: SequenceCounter,
    pub subscribe_cseq: SequenceCounter,
    pub message_cseq: SequenceCounter,
    pub dialogs: DialogRegistry,
    pub dispatcher: ResponseDispatcher,
    pub digest: DigestCalculator,
    pub builder: RequestBuilder,
    pub status: Arc<StatusReporter>,
    pub keepalive: KeepaliveMonitor,
    pub registration: RwLock<Option<Registration>>,
    call_handler: Option<Arc<dyn CallHandler>>,
    do_not_disturb: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl AgentContext {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        server_addr: SocketAddr,
        call_handler: Option<Arc<dyn CallHandler>>,
        registration_handler: Option<Arc<dyn RegistrationHandler>>,
    ) -> Self {
        let account = &config.account;
        let digest = DigestCalculator::new(
            &account.username,
            &account.password,
            &account.realm,
            &account.server_host,
            account.server_port,
        );
        let builder = RequestBuilder::new(&config, transport.local_addr());
        let status = Arc::new(StatusReporter::new(registration_handler));
        let keepalive = KeepaliveMonitor::new(&config.keepalive, status.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            transport,
            server_addr,
            ids: IdGenerator::new(),
            register_cseq: SequenceCounter::new(),
            subscribe_cseq: SequenceCounter::new(),
            message_cseq: SequenceCounter::new(),
            dialogs: DialogRegistry::new(),
            dispatcher: ResponseDispatcher::new(),
            digest,
            builder,
            status,
            keepalive,
            registration: RwLock::new(None),
            call_handler,
            do_not_disturb: AtomicBool::new(false),
            shutdown,
            config,
        }
    }

    /// Send to the server. A failed send marks the registration down.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), SipError> {
        debug!("Sending {}", message.start_line());
        self.send_bytes(message.to_bytes()).await
    }

    pub async fn send_bytes(&self, data: Bytes) -> Result<(), SipError> {
        let outgoing = OutgoingMessage {
            data,
            destination: self.server_addr,
        };
        match self.transport.send(outgoing).await {
            Ok(()) => {
                metrics::counter!("sipagent_messages_sent_total").increment(1);
                Ok(())
            }
            Err(e) => {
                error!("Send to {} failed: {}", self.server_addr, e);
                self.status.report(false).await;
                Err(e)
            }
        }
    }

    /// Tell the application about call progress
    pub async fn notify(&self, call_id: &str, status: CallStatus, message: SipMessage) {
        info!("Call {}: {}", call_id, status);
        if let Some(handler) = &self.call_handler {
            handler.on_call(CallUpdate::new(call_id, status, message)).await;
        }
    }

    pub fn has_call_handler(&self) -> bool {
        self.call_handler.is_some()
    }

    pub fn do_not_disturb(&self) -> bool {
        self.do_not_disturb.load(Ordering::SeqCst)
    }

    pub fn set_do_not_disturb(&self, enabled: bool) {
        self.do_not_disturb.store(enabled, Ordering::SeqCst);
    }

    /// Watch that flips to `true` when the agent starts shutting down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
