//! Outbound calls
//!
//! The INVITE controller only waits for the first provisional or final
//! answer; everything after that reaches the dialog through the router and
//! [`on_response`].

use super::auth::DigestMethod;
use super::builder::Values;
use super::call_state::{CallEvent, CallState};
use super::context::AgentContext;
use super::dialog::{Dialog, InviteProgress};
use super::dispatcher::TransactionKey;
use super::message::{SipError, SipMethod, SipMessage};
use super::sdp::SessionDescription;
use super::template;
use super::transaction::{self, ChallengeRetry, Step, TransactionController, TransactionKind};
use crate::domain::call::{CallStatus, MediaDescription, TransmitMode};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where an outbound call stands when `invite` returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteOutcome {
    pub call_id: String,
    pub state: CallState,
}

pub struct InviteController {
    call_id: String,
    number: String,
    media: MediaDescription,
    mode: TransmitMode,
    cseq: u32,
    retry: ChallengeRetry,
}

impl InviteController {
    pub fn new(ctx: &AgentContext, number: &str, media: MediaDescription, mode: TransmitMode) -> Self {
        Self {
            call_id: ctx.ids.call_id(),
            number: number.to_string(),
            media,
            mode,
            cseq: 0,
            retry: ChallengeRetry::new(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn send_invite(&mut self, ctx: &AgentContext, branch: String) -> Result<(), SipError> {
        let branch_for_dialog = branch.clone();
        let dialog = ctx
            .dialogs
            .update(&self.call_id, move |d| {
                let cseq = d.next_cseq();
                d.invite_cseq = cseq;
                d.invite_branch = branch_for_dialog;
                d.clone()
            })
            .await?;
        self.cseq = dialog.invite_cseq;

        let body = SessionDescription::offer(
            &ctx.config.agent.user_agent,
            dialog.session_id,
            ctx.builder.local_host(),
            &self.media,
            self.mode,
        )
        .render();
        let values = Values::for_dialog(
            &dialog,
            dialog.invite_cseq,
            &branch,
            &ctx.builder.uri(&self.number),
        );
        let message = ctx
            .builder
            .build(template::INVITE, values, dialog.auth.as_ref(), &body)?;
        ctx.send(&message).await
    }

    async fn outcome(&self, ctx: &AgentContext, state: Option<CallState>) -> InviteOutcome {
        let state = match state {
            Some(state) => state,
            None => ctx
                .dialogs
                .get(&self.call_id)
                .await
                .map(|d| d.state())
                .unwrap_or(CallState::Terminated),
        };
        InviteOutcome {
            call_id: self.call_id.clone(),
            state,
        }
    }
}

#[async_trait]
impl TransactionController for InviteController {
    type Output = InviteOutcome;

    fn kind(&self) -> TransactionKind {
        TransactionKind::Invite
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Invite)]
    }

    fn timeout(&self, ctx: &AgentContext) -> Duration {
        ctx.config.invite_timeout()
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let local_tag = ctx.ids.tag();
        let mut dialog = Dialog::outbound(
            &self.call_id,
            &local_tag,
            &ctx.builder.party(ctx.digest.username()),
            &ctx.builder.party(&self.number),
            &self.number,
        );
        dialog.session_id = ctx.ids.session_id();
        dialog.media = self.media.clone();
        dialog.mode = self.mode;
        ctx.dialogs.insert(dialog).await?;
        ctx.dialogs.transition(&self.call_id, CallEvent::Invite).await?;

        info!("Calling {} ({})", self.number, self.call_id);
        let branch = ctx.ids.invite_branch(&self.call_id);
        self.send_invite(ctx, branch).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        response: SipMessage,
    ) -> Result<Step<InviteOutcome>, SipError> {
        if !transaction::answers(&response, self.cseq) {
            // Late answer to the challenged INVITE; ACK a final one
            if response.status().is_some_and(|code| code >= 300) {
                if let Some(dialog) = ctx.dialogs.get(&self.call_id).await {
                    send_ack(ctx, &dialog, &response).await?;
                }
            }
            return Ok(Step::Continue);
        }

        if transaction::is_challenge(&response) {
            let dialog = ctx
                .dialogs
                .get(&self.call_id)
                .await
                .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
            send_ack(ctx, &dialog, &response).await?;

            let auth = self.retry.answer(
                ctx,
                &response,
                &DigestMethod::Invite {
                    target: self.number.clone(),
                },
            )?;
            ctx.dialogs.set_auth(&self.call_id, auth).await?;
            ctx.dialogs.transition(&self.call_id, CallEvent::Challenge).await?;
            self.send_invite(ctx, ctx.ids.branch()).await?;
            return Ok(Step::Continue);
        }

        let state = on_response(ctx, &response).await?;
        Ok(Step::Done(self.outcome(ctx, state).await))
    }

    async fn on_timeout(&mut self, ctx: &AgentContext) -> Result<InviteOutcome, SipError> {
        warn!("No answer to INVITE {}", self.call_id);
        if let Err(e) = ctx.dialogs.transition(&self.call_id, CallEvent::Timeout).await {
            debug!("Timeout on {}: {}", self.call_id, e);
            ctx.dialogs.remove(&self.call_id).await;
        }
        Err(SipError::Timeout(format!("INVITE {}", self.call_id)))
    }

    async fn on_failure(&mut self, ctx: &AgentContext, error: &SipError) {
        if !matches!(error, SipError::Timeout(_)) {
            ctx.dialogs.remove(&self.call_id).await;
        }
    }
}

/// ACK for a final response to one of our INVITEs
pub async fn send_ack(
    ctx: &AgentContext,
    dialog: &Dialog,
    response: &SipMessage,
) -> Result<(), SipError> {
    let cseq = response
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("response without CSeq".to_string()))?;
    let success = response.status().is_some_and(|code| (200..300).contains(&code));

    // 2xx ACK is its own transaction towards the remote target; a non-2xx
    // ACK reuses the INVITE's branch and Request-URI
    let (branch, request_uri) = if success {
        let uri = dialog
            .remote_contact
            .clone()
            .unwrap_or_else(|| ctx.builder.uri(&dialog.target));
        (ctx.ids.branch(), uri)
    } else {
        let branch = response
            .via_branch()
            .unwrap_or_else(|| dialog.invite_branch.clone());
        (branch, ctx.builder.uri(&dialog.target))
    };

    let to = response
        .to()
        .map(|to| to.value())
        .unwrap_or_else(|| dialog.remote_header());
    let values = Values::for_dialog(dialog, cseq.seq, &branch, &request_uri).set("to", to);
    let message = ctx
        .builder
        .build(template::ACK, values, dialog.auth.as_ref(), "")?;
    ctx.send(&message).await
}

/// Apply a response to an outbound INVITE (initial or re-INVITE handled by
/// the router). Returns the new call state when the response changed it.
pub async fn on_response(
    ctx: &AgentContext,
    response: &SipMessage,
) -> Result<Option<CallState>, SipError> {
    let call_id = response
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("response without Call-ID".to_string()))?;
    let code = response
        .status()
        .ok_or_else(|| SipError::InvalidMessage("not a response".to_string()))?;

    let dialog = match ctx
        .dialogs
        .update(call_id, |d| {
            d.absorb_response(response);
            match code {
                100 => d.progress = InviteProgress::Trying,
                180 | 183 => d.progress = InviteProgress::Ringing,
                _ => {}
            }
            d.clone()
        })
        .await
    {
        Ok(dialog) => dialog,
        Err(_) => {
            debug!("{} for unknown call {}", code, call_id);
            return Ok(None);
        }
    };

    let (event, status) = match code {
        100 => (CallEvent::Trying, CallStatus::Trying),
        180 | 183 => (CallEvent::Ringing, CallStatus::Ringing),
        101..=199 => return Ok(None),
        200..=299 => {
            send_ack(ctx, &dialog, response).await?;
            if dialog.state().is_established() {
                // Retransmitted 200
                return Ok(None);
            }
            (CallEvent::Answer, CallStatus::Established)
        }
        486 => {
            send_ack(ctx, &dialog, response).await?;
            (CallEvent::Busy, CallStatus::Busy)
        }
        487 => {
            send_ack(ctx, &dialog, response).await?;
            (CallEvent::Cancel, CallStatus::Ended)
        }
        503 => {
            send_ack(ctx, &dialog, response).await?;
            match dialog.progress {
                InviteProgress::Trying => (CallEvent::NotFound, CallStatus::NotFound),
                InviteProgress::Ringing => {
                    (CallEvent::Unavailable, CallStatus::TemporarilyUnavailable)
                }
                InviteProgress::None => (CallEvent::Reject, CallStatus::Failed(503)),
            }
        }
        _ => {
            send_ack(ctx, &dialog, response).await?;
            (CallEvent::Reject, CallStatus::Failed(code))
        }
    };

    match ctx.dialogs.transition(call_id, event).await {
        Ok(state) => {
            ctx.notify(call_id, status, response.clone()).await;
            Ok(Some(state))
        }
        Err(SipError::InvalidStateTransition(e)) => {
            debug!("{} ignored on {}: {}", code, call_id, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
