//! Handling for messages no transaction claimed
//!
//! Inbound requests from the server (calls, hang-ups, keepalive pings,
//! messages) and late responses to INVITEs whose transaction already
//! returned.

use super::call_state::CallEvent;
use super::context::AgentContext;
use super::dialog::Dialog;
use super::invite;
use super::message::{MessageKind, SipError, SipMethod, SipMessage};
use crate::domain::call::{CallDirection, CallStatus};
use tracing::{debug, info, warn};

/// Handle `message`; failures are logged, never propagated
pub async fn route(ctx: &AgentContext, message: SipMessage) {
    if let Err(e) = dispatch(ctx, &message).await {
        warn!("Failed to handle {}: {}", message, e);
    }
}

async fn dispatch(ctx: &AgentContext, message: &SipMessage) -> Result<(), SipError> {
    match message.kind() {
        MessageKind::Request(method) => match method {
            SipMethod::Invite => on_invite(ctx, message).await,
            SipMethod::Bye => on_bye(ctx, message).await,
            SipMethod::Cancel => on_cancel(ctx, message).await,
            SipMethod::Ack => {
                debug!("ACK for {}", message.call_id().unwrap_or_default());
                Ok(())
            }
            SipMethod::Options => {
                reply(ctx, message, 200).await?;
                ctx.keepalive.on_options().await;
                Ok(())
            }
            SipMethod::Notify => reply(ctx, message, 200).await,
            SipMethod::Message => on_message(ctx, message).await,
            SipMethod::Register
            | SipMethod::Subscribe
            | SipMethod::Refer
            | SipMethod::Info
            | SipMethod::Update
            | SipMethod::Prack
            | SipMethod::Publish => {
                debug!("Ignoring {}", message);
                Ok(())
            }
        },
        MessageKind::Response(code) => match message.cseq().map(|c| c.method) {
            Some(SipMethod::Invite) => invite::on_response(ctx, message).await.map(|_| ()),
            Some(method) => {
                debug!("Unmatched {} to {}", code, method);
                Ok(())
            }
            None => Err(SipError::InvalidMessage("response without CSeq".to_string())),
        },
    }
}

async fn reply(ctx: &AgentContext, request: &SipMessage, status: u16) -> Result<(), SipError> {
    let local_tag = match request.call_id() {
        Some(call_id) => ctx.dialogs.get(call_id).await.map(|d| d.local_tag),
        None => None,
    };
    let response = ctx
        .builder
        .response(request, status, local_tag.as_deref())?;
    ctx.send(&response).await
}

async fn on_invite(ctx: &AgentContext, invite: &SipMessage) -> Result<(), SipError> {
    let call_id = invite
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;

    if let Some(dialog) = ctx.dialogs.get(call_id).await {
        return on_reinvite(ctx, &dialog, invite).await;
    }

    if !ctx.has_call_handler() {
        debug!("No call handler, refusing {}", call_id);
        let busy = ctx.builder.response(invite, 486, Some(&ctx.ids.tag()))?;
        return ctx.send(&busy).await;
    }

    if ctx.do_not_disturb() {
        info!("Do not disturb, declining {}", call_id);
        let busy = ctx.builder.response(invite, 486, Some(&ctx.ids.tag()))?;
        ctx.send(&busy).await?;
        ctx.notify(call_id, CallStatus::Declined, invite.clone()).await;
        return Ok(());
    }

    let local_tag = ctx.ids.tag();
    let mut dialog = Dialog::inbound(invite, &local_tag)?;
    if let Some(tag) = &dialog.remote_tag {
        ctx.ids.tags().reserve(tag);
    }
    dialog.session_id = ctx.ids.session_id();
    dialog.machine.process_event(CallEvent::IncomingInvite)?;
    ctx.dialogs.insert(dialog).await?;

    let ringing = ctx.builder.response(invite, 180, Some(&local_tag))?;
    ctx.send(&ringing).await?;
    ctx.notify(call_id, CallStatus::Incoming, invite.clone()).await;
    Ok(())
}

/// INVITE for a dialog we already know
async fn on_reinvite(
    ctx: &AgentContext,
    dialog: &Dialog,
    invite: &SipMessage,
) -> Result<(), SipError> {
    if dialog.direction == CallDirection::Inbound && dialog.machine.can_answer() {
        debug!("Retransmitted INVITE for {}", dialog.call_id);
        let ringing = ctx
            .builder
            .response(invite, 180, Some(&dialog.local_tag))?;
        return ctx.send(&ringing).await;
    }

    debug!("Ignoring re-INVITE for {} while {}", dialog.call_id, dialog.state().name());
    Ok(())
}

async fn on_bye(ctx: &AgentContext, bye: &SipMessage) -> Result<(), SipError> {
    reply(ctx, bye, 200).await?;

    let Some(call_id) = bye.call_id() else {
        return Ok(());
    };
    if !ctx.dialogs.contains(call_id).await {
        debug!("BYE for unknown call {}", call_id);
        return Ok(());
    }

    if let Err(e) = ctx.dialogs.transition(call_id, CallEvent::Bye).await {
        debug!("BYE on {}: {}", call_id, e);
        ctx.dialogs.remove(call_id).await;
    }
    ctx.notify(call_id, CallStatus::Ended, bye.clone()).await;
    Ok(())
}

async fn on_cancel(ctx: &AgentContext, cancel: &SipMessage) -> Result<(), SipError> {
    reply(ctx, cancel, 200).await?;

    let Some(call_id) = cancel.call_id() else {
        return Ok(());
    };
    let Some(dialog) = ctx.dialogs.get(call_id).await else {
        debug!("CANCEL for unknown call {}", call_id);
        return Ok(());
    };

    if let Some(invite) = &dialog.pending_invite {
        let terminated = ctx
            .builder
            .response(invite, 487, Some(&dialog.local_tag))?;
        ctx.send(&terminated).await?;
    }

    if let Err(e) = ctx.dialogs.transition(call_id, CallEvent::Cancel).await {
        debug!("CANCEL on {}: {}", call_id, e);
        ctx.dialogs.remove(call_id).await;
    }
    ctx.notify(call_id, CallStatus::Declined, cancel.clone()).await;
    Ok(())
}

async fn on_message(ctx: &AgentContext, message: &SipMessage) -> Result<(), SipError> {
    reply(ctx, message, 200).await?;
    let call_id = message.call_id().unwrap_or_default();
    ctx.notify(call_id, CallStatus::Message, message.clone()).await;
    Ok(())
}
