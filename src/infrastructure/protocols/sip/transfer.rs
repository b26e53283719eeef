//! Call transfer with REFER
//!
//! A blind transfer refers the far end to a number. An attended transfer
//! also names a second call whose dialog the new leg replaces. The transfer
//! completes when a NOTIFY reports a 2xx sipfrag.

use super::auth::DigestMethod;
use super::builder::Values;
use super::call_state::{CallEvent, CallState};
use super::context::AgentContext;
use super::dialog::Dialog;
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMethod, SipMessage};
use super::template;
use super::transaction::{self, ChallengeRetry, Step, TransactionController, TransactionKind};
use crate::domain::call::CallStatus;
use async_trait::async_trait;
use tracing::{debug, info};

/// Dialog identifiers carried in a Refer-To `Replaces` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl Replaces {
    /// Identify `dialog` from the transfer target's point of view
    pub fn from_dialog(dialog: &Dialog) -> Result<Self, SipError> {
        let to_tag = dialog.remote_tag.clone().ok_or_else(|| {
            SipError::InvalidStateTransition(format!("call {} has no remote tag", dialog.call_id))
        })?;
        Ok(Self {
            call_id: dialog.call_id.clone(),
            to_tag,
            from_tag: dialog.local_tag.clone(),
        })
    }

    /// URI header suffix, escaped for use inside Refer-To
    pub fn to_uri_header(&self) -> String {
        format!(
            "?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}",
            urlencoding::encode(&self.call_id),
            urlencoding::encode(&self.to_tag),
            urlencoding::encode(&self.from_tag)
        )
    }
}

pub struct TransferController {
    call_id: String,
    refer_to: String,
    replaces: Option<Replaces>,
    cseq: u32,
    accepted: bool,
    retry: ChallengeRetry,
}

impl TransferController {
    pub fn new(call_id: &str, refer_to: &str, replaces: Option<Replaces>) -> Self {
        Self {
            call_id: call_id.to_string(),
            refer_to: refer_to.to_string(),
            replaces,
            cseq: 0,
            accepted: false,
            retry: ChallengeRetry::new(),
        }
    }

    fn digest_method(&self) -> DigestMethod {
        DigestMethod::Refer {
            target: self.refer_to.clone(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .update(&self.call_id, |d| {
                d.next_cseq();
                d.clone()
            })
            .await?;
        self.cseq = dialog.local_cseq;

        let replaces = self
            .replaces
            .as_ref()
            .map(Replaces::to_uri_header)
            .unwrap_or_default();
        let values = Values::for_dialog(
            &dialog,
            self.cseq,
            &ctx.ids.branch(),
            &ctx.builder.uri_with_port(&dialog.target),
        )
        .set("refer_to", &self.refer_to)
        .set("replaces", replaces);
        let auth = transaction::reauthorize(ctx, dialog.auth.as_ref(), &self.digest_method());
        let message = ctx
            .builder
            .build(template::REFER, values, auth.as_ref(), "")?;
        ctx.send(&message).await
    }

    async fn on_notify(
        &mut self,
        ctx: &AgentContext,
        notify: SipMessage,
    ) -> Result<Step<CallState>, SipError> {
        let local_tag = ctx.dialogs.get(&self.call_id).await.map(|d| d.local_tag);
        let ok = ctx.builder.response(&notify, 200, local_tag.as_deref())?;
        ctx.send(&ok).await?;

        match notify.sipfrag_status() {
            Some(100..=199) | None => {
                debug!("Transfer of {} in progress", self.call_id);
                Ok(Step::Continue)
            }
            Some(200..=299) => {
                let state = ctx
                    .dialogs
                    .transition(&self.call_id, CallEvent::Transfer)
                    .await?;
                info!("Call {} transferred to {}", self.call_id, self.refer_to);
                ctx.notify(&self.call_id, CallStatus::Transferred, notify).await;
                Ok(Step::Done(state))
            }
            Some(code) => Err(SipError::rejected(code)),
        }
    }
}

#[async_trait]
impl TransactionController for TransferController {
    type Output = CallState;

    fn kind(&self) -> TransactionKind {
        TransactionKind::Transfer
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![
            TransactionKey::new(&self.call_id, SipMethod::Refer),
            TransactionKey::new(&self.call_id, SipMethod::Notify),
        ]
    }

    fn accepts_requests(&self) -> bool {
        true
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .get(&self.call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        if !dialog.state().is_established() {
            return Err(SipError::InvalidStateTransition(format!(
                "transfer while {}",
                dialog.state().name()
            )));
        }

        info!("Transferring {} to {}", self.call_id, self.refer_to);
        self.send(ctx).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        message: SipMessage,
    ) -> Result<Step<CallState>, SipError> {
        if message.method() == Some(SipMethod::Notify) {
            return self.on_notify(ctx, message).await;
        }
        if message.is_request() {
            return Ok(Step::Continue);
        }
        if !transaction::answers(&message, self.cseq) {
            return Ok(Step::Continue);
        }

        match message.status().unwrap_or_default() {
            100..=199 => Ok(Step::Continue),
            401 | 407 => {
                let auth = self.retry.answer(ctx, &message, &self.digest_method())?;
                ctx.dialogs.set_auth(&self.call_id, auth).await?;
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => {
                if !self.accepted {
                    debug!("REFER for {} accepted", self.call_id);
                    self.accepted = true;
                }
                Ok(Step::Continue)
            }
            code => Err(SipError::rejected(code)),
        }
    }
}
