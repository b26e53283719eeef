//! Registration controllers
//!
//! REGISTER brings the account up; the log-off sequence is an Expires: 0
//! REGISTER followed by an Expires: 0 SUBSCRIBE for message-summary.

use super::auth::{AuthInfo, DigestMethod};
use super::builder::Values;
use super::context::AgentContext;
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMethod, SipMessage};
use super::template;
use super::transaction::{
    self, ChallengeRetry, ServerErrorRetry, Step, TransactionController, TransactionKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds before expiry at which the registration is refreshed
const REFRESH_MARGIN_SECS: u32 = 5;

/// An accepted registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub call_id: String,
    pub local_tag: String,
    /// Credentials the server last accepted
    pub auth: Option<AuthInfo>,
    /// Lifetime granted by the server
    pub expires: u32,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.registered_at + chrono::Duration::seconds(i64::from(self.expires))
    }

    /// Delay until the refresh REGISTER is due
    pub fn refresh_in(&self) -> Duration {
        let secs = self.expires.saturating_sub(REFRESH_MARGIN_SECS).max(1);
        Duration::from_secs(u64::from(secs))
    }
}

/// Lifetime the server granted in a 200 to REGISTER
fn granted_expires(response: &SipMessage) -> Option<u32> {
    let from_contact = response.header("Contact").and_then(|contact| {
        contact
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("expires="))
            .find_map(|v| v.trim().parse().ok())
    });
    from_contact.or_else(|| response.header("Expires")?.trim().parse().ok())
}

/// REGISTER, challenged at most once and re-sent at most once after a
/// server error
pub struct RegisterController {
    call_id: String,
    local_tag: String,
    cseq: u32,
    auth: Option<AuthInfo>,
    retry: ChallengeRetry,
    server_retry: ServerErrorRetry,
}

impl RegisterController {
    /// First registration on a fresh Call-ID
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            call_id: ctx.ids.call_id(),
            local_tag: ctx.ids.tag(),
            cseq: 0,
            auth: None,
            retry: ChallengeRetry::new(),
            server_retry: ServerErrorRetry::new(),
        }
    }

    /// Refresh of `previous`, reusing its Call-ID, tag and credentials
    pub fn refresh(previous: &Registration) -> Self {
        Self {
            call_id: previous.call_id.clone(),
            local_tag: previous.local_tag.clone(),
            cseq: 0,
            auth: previous.auth.clone(),
            retry: ChallengeRetry::new(),
            server_retry: ServerErrorRetry::new(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        self.cseq = ctx.register_cseq.next();
        let values = Values::new()
            .set("call_id", &self.call_id)
            .set("local_tag", &self.local_tag)
            .set("branch", ctx.ids.register_branch())
            .set("cseq", self.cseq);
        let message = ctx
            .builder
            .build(template::REGISTER, values, self.auth.as_ref(), "")?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for RegisterController {
    type Output = Registration;

    fn kind(&self) -> TransactionKind {
        TransactionKind::Register
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Register)]
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        info!("Registering {} with {}", ctx.digest.username(), ctx.server_addr);
        self.send(ctx).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        response: SipMessage,
    ) -> Result<Step<Registration>, SipError> {
        if !transaction::answers(&response, self.cseq) {
            debug!("Ignoring stale {}", response);
            return Ok(Step::Continue);
        }

        match response.status().unwrap_or_default() {
            100..=199 => Ok(Step::Continue),
            401 | 407 => {
                self.auth = Some(self.retry.answer(ctx, &response, &DigestMethod::Register)?);
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => {
                let expires = granted_expires(&response).unwrap_or(ctx.config.agent.expires);
                info!("Registered for {}s", expires);
                Ok(Step::Done(Registration {
                    call_id: self.call_id.clone(),
                    local_tag: self.local_tag.clone(),
                    auth: self.auth.take(),
                    expires,
                    registered_at: Utc::now(),
                }))
            }
            code @ (500 | 503) => match self.server_retry.delay(ctx, &response) {
                Some(delay) => {
                    warn!("REGISTER answered {}, retrying in {:?}", code, delay);
                    Ok(Step::RetryAfter(delay))
                }
                None => Err(SipError::rejected(code)),
            },
            code => Err(SipError::rejected(code)),
        }
    }
}

/// Expires: 0 REGISTER on the registration's Call-ID
pub struct DeregisterController {
    registration: Registration,
    cseq: u32,
    auth: Option<AuthInfo>,
    retry: ChallengeRetry,
    server_retry: ServerErrorRetry,
}

impl DeregisterController {
    pub fn new(registration: Registration) -> Self {
        let auth = registration.auth.clone();
        Self {
            registration,
            cseq: 0,
            auth,
            retry: ChallengeRetry::new(),
            server_retry: ServerErrorRetry::new(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        self.cseq = ctx.register_cseq.next();
        let values = Values::new()
            .set("call_id", &self.registration.call_id)
            .set("local_tag", &self.registration.local_tag)
            .set("branch", ctx.ids.register_branch())
            .set("cseq", self.cseq);
        let message = ctx
            .builder
            .build(template::UNREGISTER, values, self.auth.as_ref(), "")?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for DeregisterController {
    type Output = ();

    fn kind(&self) -> TransactionKind {
        TransactionKind::Deregister
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.registration.call_id, SipMethod::Register)]
    }

    fn cancellable(&self) -> bool {
        false
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        info!("Deregistering {}", ctx.digest.username());
        self.send(ctx).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        response: SipMessage,
    ) -> Result<Step<()>, SipError> {
        if !transaction::answers(&response, self.cseq) {
            return Ok(Step::Continue);
        }

        match response.status().unwrap_or_default() {
            100..=199 => Ok(Step::Continue),
            401 | 407 => {
                self.auth = Some(self.retry.answer(ctx, &response, &DigestMethod::Register)?);
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => Ok(Step::Done(())),
            code @ (500 | 503) => match self.server_retry.delay(ctx, &response) {
                Some(delay) => {
                    warn!("Deregistration answered {}, retrying in {:?}", code, delay);
                    Ok(Step::RetryAfter(delay))
                }
                None => Err(SipError::rejected(code)),
            },
            code => Err(SipError::rejected(code)),
        }
    }
}

/// Expires: 0 SUBSCRIBE dropping the message-summary subscription
pub struct SubscribeController {
    call_id: String,
    local_tag: String,
    cseq: u32,
    auth: Option<AuthInfo>,
    retry: ChallengeRetry,
}

impl SubscribeController {
    pub fn unsubscribe(ctx: &AgentContext) -> Self {
        Self {
            call_id: ctx.ids.call_id(),
            local_tag: ctx.ids.tag(),
            cseq: 0,
            auth: None,
            retry: ChallengeRetry::new(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        self.cseq = ctx.subscribe_cseq.next();
        let values = Values::new()
            .set("call_id", &self.call_id)
            .set("local_tag", &self.local_tag)
            .set("branch", ctx.ids.branch())
            .set("cseq", self.cseq);
        let message = ctx
            .builder
            .build(template::UNSUBSCRIBE, values, self.auth.as_ref(), "")?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for SubscribeController {
    type Output = ();

    fn kind(&self) -> TransactionKind {
        TransactionKind::Subscribe
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Subscribe)]
    }

    fn cancellable(&self) -> bool {
        false
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        self.send(ctx).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        response: SipMessage,
    ) -> Result<Step<()>, SipError> {
        if !transaction::answers(&response, self.cseq) {
            return Ok(Step::Continue);
        }

        match response.status().unwrap_or_default() {
            100..=199 => Ok(Step::Continue),
            401 | 407 => {
                self.auth = Some(self.retry.answer(ctx, &response, &DigestMethod::Subscribe)?);
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => Ok(Step::Done(())),
            code => Err(SipError::rejected(code)),
        }
    }
}
