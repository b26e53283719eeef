//! Hold and resume via re-INVITE
//!
//! Hold re-offers the call's media with the connection address zeroed;
//! resume re-offers it with the real address. Both reuse the nonce cached
//! for the call.

use super::auth::DigestMethod;
use super::builder::Values;
use super::call_state::{CallEvent, CallState};
use super::context::AgentContext;
use super::dispatcher::TransactionKey;
use super::invite::send_ack;
use super::message::{SipError, SipMethod, SipMessage};
use super::sdp::SessionDescription;
use super::template;
use super::transaction::{self, ChallengeRetry, Step, TransactionController, TransactionKind};
use crate::domain::call::{CallStatus, MediaDescription, TransmitMode};
use async_trait::async_trait;
use tracing::info;

pub struct HoldController {
    call_id: String,
    hold: bool,
    media: MediaDescription,
    mode: TransmitMode,
    cseq: u32,
    retry: ChallengeRetry,
}

impl HoldController {
    pub fn new(call_id: &str, hold: bool, media: MediaDescription, mode: TransmitMode) -> Self {
        Self {
            call_id: call_id.to_string(),
            hold,
            media,
            mode,
            cseq: 0,
            retry: ChallengeRetry::new(),
        }
    }

    fn digest_method(target: &str) -> DigestMethod {
        DigestMethod::ReferInvite {
            target: target.to_string(),
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

        let mut offer = SessionDescription::offer(
            &ctx.config.agent.user_agent,
            dialog.session_id,
            ctx.builder.local_host(),
            &self.media,
            self.mode,
        );
        offer.version = dialog.session_id.wrapping_add(self.cseq);
        if self.hold {
            offer = offer.on_hold();
        }
        let body = offer.render();

        let values = Values::for_dialog(
            &dialog,
            self.cseq,
            &ctx.ids.branch(),
            &ctx.builder.uri_with_port(&dialog.target),
        );
        let auth = transaction::reauthorize(
            ctx,
            dialog.auth.as_ref(),
            &Self::digest_method(&dialog.target),
        );
        let message = ctx
            .builder
            .build(template::INVITE, values, auth.as_ref(), &body)?;
        ctx.send(&message).await
    }
}

#[async_trait]
impl TransactionController for HoldController {
    type Output = CallState;

    fn kind(&self) -> TransactionKind {
        if self.hold {
            TransactionKind::Hold
        } else {
            TransactionKind::Resume
        }
    }

    fn keys(&self) -> Vec<TransactionKey> {
        vec![TransactionKey::new(&self.call_id, SipMethod::Invite)]
    }

    async fn start(&mut self, ctx: &AgentContext) -> Result<(), SipError> {
        let dialog = ctx
            .dialogs
            .get(&self.call_id)
            .await
            .ok_or_else(|| SipError::DialogNotFound(self.call_id.clone()))?;
        let expected = if self.hold {
            CallState::Established
        } else {
            CallState::OnHold
        };
        if dialog.state() != expected {
            return Err(SipError::InvalidStateTransition(format!(
                "{} while {}",
                self.kind(),
                dialog.state().name()
            )));
        }

        info!("{} {}", if self.hold { "Holding" } else { "Resuming" }, self.call_id);
        self.send(ctx).await
    }

    async fn on_message(
        &mut self,
        ctx: &AgentContext,
        response: SipMessage,
    ) -> Result<Step<CallState>, SipError> {
        if !transaction::answers(&response, self.cseq) {
            return Ok(Step::Continue);
        }

        let dialog = ctx
            .dialogs
            .update(&self.call_id, |d| {
                d.absorb_response(&response);
                d.clone()
            })
            .await?;

        match response.status().unwrap_or_default() {
            100..=199 => Ok(Step::Continue),
            401 | 407 => {
                send_ack(ctx, &dialog, &response).await?;
                let auth = self
                    .retry
                    .answer(ctx, &response, &Self::digest_method(&dialog.target))?;
                ctx.dialogs.set_auth(&self.call_id, auth).await?;
                self.send(ctx).await?;
                Ok(Step::Continue)
            }
            200..=299 => {
                send_ack(ctx, &dialog, &response).await?;
                let media = self.media.clone();
                let mode = self.mode;
                ctx.dialogs
                    .update(&self.call_id, move |d| {
                        d.media = media;
                        d.mode = mode;
                    })
                    .await?;

                let (event, status) = if self.hold {
                    (CallEvent::Hold, CallStatus::OnHold)
                } else {
                    (CallEvent::Resume, CallStatus::Established)
                };
                let state = ctx.dialogs.transition(&self.call_id, event).await?;
                ctx.notify(&self.call_id, status, response).await;
                Ok(Step::Done(state))
            }
            code => {
                send_ack(ctx, &dialog, &response).await?;
                Err(SipError::rejected(code))
            }
        }
    }
}
