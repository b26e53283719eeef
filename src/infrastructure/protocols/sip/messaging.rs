//! Out-of-dialog instant messages

use super::auth::{AuthInfo, DigestMethod};
use super::builder::Values;
use super::context::AgentContext;
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMethod, SipMessage};
use super::template;
use super::transaction::{self, ChallengeRetry, Step, TransactionController, TransactionKind};
use async_trait::async_trait;
use tracing::info;

pub struct MessageController {
    call_id: String,
    local_tag: String,
    number: String,
    text: String,
    cseq: u32,
    auth: Option<AuthInfo>,
    retry: ChallengeRetry,
}

impl MessageController {
    pub fn new(ctx: &AgentContext, number: &str, text: &str) -> Self {
        Self {
            call_id: ctx.ids.call_id(),
            local_tag: ctx.ids.tag(),
            number: number.to_string(),
            text: text.to_string(),
            cseq: 0,
            auth: None,
            retry: ChallengeRetry::new(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        self.cseq = ctx.message_cseq.next();
        let from = format!(
            "{};tag={}",
            ctx.builder.party(ctx.digest.username()),
            self.local_tag
        );
        let values = Values::new()
            .set("request_uri", ctx.builder.uri(&self.number))
            .set("to", ctx.builder.party(&self.number))
            .set("from", from)
            .set("call_id", &self.call_id)
            .set("cseq", self.cseq)
            .set("branch", ctx.ids.branch());
        let message = ctx
            .builder
            .build(template::MESSAGE, values, self.auth.as_ref(), &self.text)?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for MessageController {
    type Output = ();

    fn kind(&self) -> TransactionKind {
        TransactionKind::Message
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Message)]
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        info!("Sending message to {}", self.number);
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
                let method = DigestMethod::Message {
                    target: self.number.clone(),
                };
                self.auth = Some(self.retry.answer(ctx, &response, &method)?);
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => Ok(Step::Done(())),
            code => Err(SipError::rejected(code)),
        }
    }
}
