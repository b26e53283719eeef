//! Call status notifications delivered to the application

use crate::infrastructure::protocols::sip::SipMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call progress as reported to the application's call handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// 100 Trying received for our INVITE
    Trying,
    /// The far end is alerting
    Ringing,
    /// Inbound INVITE; we answered 180 and are ringing
    Incoming,
    Established,
    OnHold,
    Busy,
    /// Rejected by do-not-disturb or cancelled by the caller
    Declined,
    Ended,
    Transferred,
    NotFound,
    TemporarilyUnavailable,
    /// Inbound MESSAGE
    Message,
    /// Any other final failure for a known dialog
    Failed(u16),
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Busy
                | CallStatus::Declined
                | CallStatus::Ended
                | CallStatus::NotFound
                | CallStatus::TemporarilyUnavailable
                | CallStatus::Failed(_)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Trying => write!(f, "trying"),
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::Incoming => write!(f, "incoming"),
            CallStatus::Established => write!(f, "established"),
            CallStatus::OnHold => write!(f, "on-hold"),
            CallStatus::Busy => write!(f, "busy"),
            CallStatus::Declined => write!(f, "declined"),
            CallStatus::Ended => write!(f, "ended"),
            CallStatus::Transferred => write!(f, "transferred"),
            CallStatus::NotFound => write!(f, "not-found"),
            CallStatus::TemporarilyUnavailable => write!(f, "temporarily-unavailable"),
            CallStatus::Message => write!(f, "message"),
            CallStatus::Failed(code) => write!(f, "failed({})", code),
        }
    }
}

/// A message annotated with the call status it caused
#[derive(Debug, Clone)]
pub struct CallUpdate {
    pub call_id: String,
    pub status: CallStatus,
    pub message: SipMessage,
}

impl CallUpdate {
    pub fn new(call_id: &str, status: CallStatus, message: SipMessage) -> Self {
        Self {
            call_id: call_id.to_string(),
            status,
            message,
        }
    }
}
