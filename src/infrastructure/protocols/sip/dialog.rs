//! Dialog registry
//!
//! Dialogs are keyed by Call-ID and shared between the calling task and the
//! receive loop. Every access goes through the registry's lock; callers get
//! clones, never references into the map.

use super::auth::AuthInfo;
use super::call_state::{CallEvent, CallState, CallStateMachine};
use super::message::{SipError, SipMessage};
use crate::domain::call::{CallDirection, MediaDescription, TransmitMode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Progress marker used to classify a 503 on an outbound INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InviteProgress {
    #[default]
    None,
    /// 100 Trying seen
    Trying,
    /// 180/183 seen
    Ringing,
}

/// One call
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub direction: CallDirection,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Our From/To header value without tag
    pub local_party: String,
    /// Their From/To header value without tag
    pub remote_party: String,
    /// Number on the far end
    pub target: String,
    pub remote_contact: Option<String>,
    /// Last CSeq number we used
    pub local_cseq: u32,
    pub invite_cseq: u32,
    pub invite_branch: String,
    pub session_id: u32,
    pub media: MediaDescription,
    pub mode: TransmitMode,
    pub progress: InviteProgress,
    /// Credentials from the last authenticated exchange on this Call-ID
    pub auth: Option<AuthInfo>,
    /// Inbound INVITE waiting for answer/decline
    pub pending_invite: Option<SipMessage>,
    pub machine: CallStateMachine,
}

impl Dialog {
    /// Dialog for an INVITE we are about to send
    pub fn outbound(call_id: &str, local_tag: &str, local_party: &str, remote_party: &str, target: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            direction: CallDirection::Outbound,
            local_tag: local_tag.to_string(),
            remote_tag: None,
            local_party: local_party.to_string(),
            remote_party: remote_party.to_string(),
            target: target.to_string(),
            remote_contact: None,
            local_cseq: 0,
            invite_cseq: 0,
            invite_branch: String::new(),
            session_id: 0,
            media: MediaDescription::default(),
            mode: TransmitMode::default(),
            progress: InviteProgress::None,
            auth: None,
            pending_invite: None,
            machine: CallStateMachine::new(),
        }
    }

    /// Dialog for an INVITE we received
    pub fn inbound(invite: &SipMessage, local_tag: &str) -> Result<Self, SipError> {
        let call_id = invite
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;
        let from = invite
            .from()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without From".to_string()))?;
        let to = invite
            .to()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without To".to_string()))?;
        let cseq = invite
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?;

        let mut dialog = Self::outbound(call_id, local_tag, &to.raw, &from.raw, &from.number);
        dialog.direction = CallDirection::Inbound;
        dialog.remote_tag = from.tag;
        dialog.remote_contact = invite.contact_uri();
        dialog.invite_cseq = cseq.seq;
        dialog.invite_branch = invite.via_branch().unwrap_or_default();
        dialog.pending_invite = Some(invite.clone());
        Ok(dialog)
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    /// Next CSeq for a request inside this dialog
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Our header value (with tag)
    pub fn local_header(&self) -> String {
        format!("{};tag={}", self.local_party, self.local_tag)
    }

    /// Their header value (with tag once known)
    pub fn remote_header(&self) -> String {
        match &self.remote_tag {
            Some(tag) => format!("{};tag={}", self.remote_party, tag),
            None => self.remote_party.clone(),
        }
    }

    /// Learn the remote tag and contact from a response to our request
    pub fn absorb_response(&mut self, response: &SipMessage) {
        if self.direction == CallDirection::Outbound {
            if let Some(tag) = response.to().and_then(|to| to.tag) {
                self.remote_tag = Some(tag);
            }
        }
        if let Some(contact) = response.contact_uri() {
            self.remote_contact = Some(contact);
        }
    }
}

/// Call-ID → dialog map
#[derive(Debug, Clone, Default)]
pub struct DialogRegistry {
    dialogs: Arc<RwLock<HashMap<String, Dialog>>>,
}

impl DialogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new dialog; a Call-ID can only be registered once
    pub async fn insert(&self, dialog: Dialog) -> Result<(), SipError> {
        let mut dialogs = self.dialogs.write().await;
        if dialogs.contains_key(&dialog.call_id) {
            return Err(SipError::Internal(format!(
                "dialog {} already exists",
                dialog.call_id
            )));
        }
        debug!("Dialog {} created ({:?})", dialog.call_id, dialog.direction);
        dialogs.insert(dialog.call_id.clone(), dialog);
        Ok(())
    }

    pub async fn get(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.read().await.get(call_id).cloned()
    }

    pub async fn contains(&self, call_id: &str) -> bool {
        self.dialogs.read().await.contains_key(call_id)
    }

    /// Apply `f` to the dialog under the write lock
    pub async fn update<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut Dialog) -> R,
    ) -> Result<R, SipError> {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs
            .get_mut(call_id)
            .ok_or_else(|| SipError::DialogNotFound(call_id.to_string()))?;
        Ok(f(dialog))
    }

    /// Drive the dialog's state machine; terminal states remove the dialog
    pub async fn transition(&self, call_id: &str, event: CallEvent) -> Result<CallState, SipError> {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs
            .get_mut(call_id)
            .ok_or_else(|| SipError::DialogNotFound(call_id.to_string()))?;
        let state = dialog.machine.process_event(event)?;
        debug!("Dialog {} -> {}", call_id, state.name());
        if state.is_terminal() {
            dialogs.remove(call_id);
            debug!("Dialog {} removed", call_id);
        }
        Ok(state)
    }

    pub async fn next_cseq(&self, call_id: &str) -> Result<u32, SipError> {
        self.update(call_id, Dialog::next_cseq).await
    }

    pub async fn set_auth(&self, call_id: &str, auth: AuthInfo) -> Result<(), SipError> {
        self.update(call_id, |d| d.auth = Some(auth)).await
    }

    pub async fn auth(&self, call_id: &str) -> Option<AuthInfo> {
        self.dialogs
            .read()
            .await
            .get(call_id)
            .and_then(|d| d.auth.clone())
    }

    pub async fn remove(&self, call_id: &str) -> Option<Dialog> {
        let removed = self.dialogs.write().await.remove(call_id);
        if removed.is_some() {
            debug!("Dialog {} removed", call_id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.dialogs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.dialogs.read().await.is_empty()
    }

    pub async fn call_ids(&self) -> Vec<String> {
        self.dialogs.read().await.keys().cloned().collect()
    }

    pub async fn clear(&self) {
        self.dialogs.write().await.clear();
    }
}
