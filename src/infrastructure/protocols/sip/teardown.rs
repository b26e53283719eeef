//! Ending calls: BYE for established calls, CANCEL for unanswered ones

use super::auth::DigestMethod;
use super::builder::Values;
use super::call_state::CallEvent;
use super::context::AgentContext;
use super::dialog::Dialog;
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMethod, SipMessage};
use super::template;
use super::transaction::{self, ChallengeRetry, Step, TransactionController, TransactionKind};
use crate::domain::call::{CallDirection, CallStatus};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// BYE. The call is over locally as soon as the request is out; the
/// transaction only waits for the server to confirm.
pub struct ByeController {
    call_id: String,
    dialog: Option<Dialog>,
    cseq: u32,
    retry: ChallengeRetry,
}

impl ByeController {
    pub fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            dialog: None,
            cseq: 0,
            retry: ChallengeRetry::new(),
        }
    }

    async fn send(&mut self, ctx: &AgentContext) -> Result<SipMessage, SipError> {
        let dialog = self
            .dialog
            .as_mut()
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        self.cseq = dialog.next_cseq();

        let request_uri = dialog
            .remote_contact
            .clone()
            .unwrap_or_else(|| ctx.builder.uri_with_port(&dialog.target));
        let values = Values::for_dialog(dialog, self.cseq, &ctx.ids.branch(), &request_uri);
        let method = DigestMethod::Bye {
            target: dialog.target.clone(),
        };
        let auth = transaction::reauthorize(ctx, dialog.auth.as_ref(), &method);
        let message = ctx
            .builder
            .build(template::BYE, values, auth.as_ref(), "")?;
        ctx.send(&message).await?;
        SipMessage::parse(&message.to_bytes())
    }
}

#[async_trait]
impl TransactionController for ByeController {
    type Output = ();

    fn kind(&self) -> TransactionKind {
        TransactionKind::Bye
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Bye)]
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .get(&self.call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        if !dialog.machine.can_terminate() {
            return Err(SipError::InvalidStateTransition(format!(
                "BYE while {}",
                dialog.state().name()
            )));
        }
        self.dialog = Some(dialog);

        info!("Hanging up {}", self.call_id);
        let request = self.send(ctx).await?;
        ctx.dialogs.transition(&self.call_id, CallEvent::Bye).await?;
        ctx.notify(&self.call_id, CallStatus::Ended, request).await;
        Ok(())
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
                let target = self
                    .dialog
                    .as_ref()
                    .map(|d| d.target.clone())
                    .unwrap_or_default();
                let auth = self
                    .retry
                    .answer(ctx, &response, &DigestMethod::Bye { target })?;
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.auth = Some(auth);
                }
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => Ok(Step::Done(())),
            code => {
                warn!("BYE for {} answered {}", self.call_id, code);
                Err(SipError::rejected(code))
            }
        }
    }
}

/// CANCEL for an outbound call that has not been answered
pub struct CancelController {
    call_id: String,
    cseq: u32,
    retry: ChallengeRetry,
}

impl CancelController {
    pub fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            cseq: 0,
            retry: ChallengeRetry::new(),
        }
    }

    async fn send(
        &mut self,
        ctx: &AgentContext,
        fresh: Option<super::auth::AuthInfo>,
    ) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .get(&self.call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        self.cseq = dialog.invite_cseq;

        // Same branch, CSeq number, Request-URI and To as the INVITE
        let values = Values::for_dialog(
            &dialog,
            dialog.invite_cseq,
            &dialog.invite_branch,
            &ctx.builder.uri(&dialog.target),
        )
        .set("to", &dialog.remote_party);
        let method = DigestMethod::Invite {
            target: dialog.target.clone(),
        };
        let auth = fresh.or_else(|| transaction::reauthorize(ctx, dialog.auth.as_ref(), &method));
        let message = ctx
            .builder
            .build(template::CANCEL, values, auth.as_ref(), "")?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for CancelController {
    type Output = ();

    fn kind(&self) -> TransactionKind {
        TransactionKind::Cancel
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Cancel)]
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .get(&self.call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        if dialog.direction != CallDirection::Outbound || !dialog.machine.can_cancel() {
            return Err(SipError::InvalidStateTransition(format!(
                "CANCEL while {}",
                dialog.state().name()
            )));
        }

        info!("Cancelling {}", self.call_id);
        self.send(ctx, None).await
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
                let target = ctx
                    .dialogs
                    .get(&self.call_id)
                    .await
                    .map(|d| d.target)
                    .unwrap_or_default();
                let auth = self
                    .retry
                    .answer(ctx, &response, &DigestMethod::Invite { target })?;
                self.send(ctx, Some(auth)).await?;
                Ok(Step::Continue)
            }
            // The INVITE's 487 finishes the dialog through the router
            200..=299 => {
                debug!("CANCEL for {} accepted", self.call_id);
                Ok(Step::Done(()))
            }
            code => Err(SipError::rejected(code)),
        }
    }

    async fn on_failure(&mut self, ctx: &AgentContext, error: &SipError) {
        if matches!(error, SipError::Timeout(_)) {
            ctx.dialogs.remove(&self.call_id).await;
        }
    }
}
