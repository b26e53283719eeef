//! Client transactions
//!
//! Every outbound exchange (REGISTER, INVITE, REFER, ...) is a controller
//! driven by [`run`]: subscribe to the keys the answers will arrive on, send
//! the first request, then feed each matching message to the controller
//! until it finishes, the deadline passes or the agent shuts down.
//!
//! A controller may answer a 401/407 exactly once. A second challenge, or a
//! challenge that cannot be answered, ends the transaction with
//! [`SipError::ChallengeExhausted`]. Registration controllers may also
//! re-send once after a 500 or 503 via [`Step::RetryAfter`].

use super::auth::{AuthInfo, DigestMethod};
use super::context::AgentContext;
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMessage};
use super::router;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a transaction is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Register,
    Deregister,
    Subscribe,
    Invite,
    Hold,
    Resume,
    Transfer,
    Bye,
    Cancel,
    Message,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Register => "register",
            TransactionKind::Deregister => "deregister",
            TransactionKind::Subscribe => "subscribe",
            TransactionKind::Invite => "invite",
            TransactionKind::Hold => "hold",
            TransactionKind::Resume => "resume",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Bye => "bye",
            TransactionKind::Cancel => "cancel",
            TransactionKind::Message => "message",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of feeding one message to a controller
#[derive(Debug)]
pub enum Step<T> {
    Continue,
    Done(T),
    /// Wait, then send the request again with a fresh deadline
    RetryAfter(Duration),
}

#[async_trait]
pub trait TransactionController: Send {
    type Output: Send;

    fn kind(&self) -> TransactionKind;

    /// Keys the answers will arrive on
    fn keys(&self) -> Vec<TransactionKey>;

    fn timeout(&self, ctx: &AgentContext) -> Duration {
        ctx.config.transaction_timeout()
    }

    /// Whether agent shutdown aborts this transaction
    fn cancellable(&self) -> bool {
        true
    }

    /// Whether requests on our keys are for us (NOTIFY during a transfer).
    /// Otherwise they go to the router.
    fn accepts_requests(&self) -> bool {
        false
    }

    /// Send the initial request, and again after [`Step::RetryAfter`]
    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError>;

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        message: SipMessage,
    ) -> Result<Step<Self::Output>, SipError>;

    /// Deadline passed without the controller finishing
    async fn on_timeout(&mut self, _ctx: &AgentContext) -> Result<Self::Output, SipError> {
        Err(SipError::Timeout(self.kind().to_string()))
    }

    /// Clean up after any failure
    async fn on_failure(&mut self, _ctx: &AgentContext, _error: &SipError) {}
}

/// Drive `controller` to completion
pub async fn run<C: TransactionController>(
    ctx: &AgentContext,
    mut controller: C,
) -> Result<C::Output, SipError> {
    let kind = controller.kind();
    let cancellable = controller.cancellable();
    if cancellable && ctx.is_shutting_down() {
        return Err(SipError::Cancelled);
    }

    let mut subscription = ctx.dispatcher.attach(controller.keys())?;
    let mut shutdown = ctx.shutdown_signal();
    let mut deadline = Instant::now() + controller.timeout(ctx);
    metrics::counter!("sipagent_transactions_started_total", "kind" => kind.as_str()).increment(1);
    debug!("Transaction {} started", kind);

    let result = async {
        controller.start(ctx).await?;
        loop {
            let next = tokio::select! {
                next = subscription.next_until(deadline) => next,
                _ = shutdown.wait_for(|stopping| *stopping), if cancellable => {
                    return Err(SipError::Cancelled);
                }
            };

            let message = match next {
                Ok(message) => message,
                Err(SipError::Timeout(_)) => return controller.on_timeout(ctx).await,
                Err(e) => return Err(e),
            };

            if message.is_request() && !controller.accepts_requests() {
                router::route(ctx, message).await;
                continue;
            }

            match controller.on_message(ctx, message).await? {
                Step::Continue => {}
                Step::Done(output) => return Ok(output),
                Step::RetryAfter(delay) => {
                    debug!("Transaction {} retrying in {:?}", kind, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stopping| *stopping), if cancellable => {
                            return Err(SipError::Cancelled);
                        }
                    }
                    controller.start(ctx).await?;
                    deadline = Instant::now() + controller.timeout(ctx);
                }
            }
        }
    }
    .await;

    for message in subscription.close() {
        router::route(ctx, message).await;
    }

    if let Err(e) = &result {
        warn!("Transaction {} failed: {}", kind, e);
        metrics::counter!("sipagent_transactions_failed_total", "kind" => kind.as_str())
            .increment(1);
        controller.on_failure(ctx, e).await;
    } else {
        debug!("Transaction {} finished", kind);
    }
    result
}

/// One-shot allowance for re-sending after a 500 or 503
#[derive(Debug, Default)]
pub struct ServerErrorRetry {
    used: bool,
}

impl ServerErrorRetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the single re-send: the server's Retry-After, else the
    /// configured default. `None` once the re-send has been spent.
    pub fn delay(&mut self, ctx: &AgentContext, response: &SipMessage) -> Option<Duration> {
        if self.used {
            return None;
        }
        self.used = true;
        Some(
            response
                .retry_after()
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.retry_after()),
        )
    }
}

/// One-shot allowance for answering an authentication challenge
#[derive(Debug, Default)]
pub struct ChallengeRetry {
    used: bool,
}

impl ChallengeRetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used(&self) -> bool {
        self.used
    }

    /// Credentials answering the 401/407 in `response`
    pub fn answer(
        &mut self,
        ctx: &AgentContext,
        response: &SipMessage,
        method: &DigestMethod,
    ) -> Result<AuthInfo, SipError> {
        if self.used {
            return Err(SipError::ChallengeExhausted(format!(
                "{} challenged again",
                method.method_name()
            )));
        }
        self.used = true;

        let challenge = response.challenge().ok_or_else(|| {
            SipError::ChallengeExhausted(format!(
                "{} challenge without a nonce",
                method.method_name()
            ))
        })?;
        ctx.digest
            .authorize(&challenge, method)
            .map_err(|e| SipError::ChallengeExhausted(e.to_string()))
    }
}

/// Recompute cached credentials for another method on the same nonce
pub fn reauthorize(
    ctx: &AgentContext,
    cached: Option<&AuthInfo>,
    method: &DigestMethod,
) -> Option<AuthInfo> {
    let cached = cached?;
    match ctx.digest.authorize_nonce(cached.kind, &cached.raw_nonce, method) {
        Ok(auth) => Some(auth),
        Err(e) => {
            warn!("Cached credentials unusable for {}: {}", method.method_name(), e);
            None
        }
    }
}

/// Whether `response` is a 401/407 challenge
pub fn is_challenge(response: &SipMessage) -> bool {
    matches!(response.status(), Some(401 | 407))
}

/// Whether `response` answers the request we sent with `cseq`
pub fn answers(response: &SipMessage, cseq: u32) -> bool {
    response.cseq().is_some_and(|c| c.seq == cseq)
}
