//! Call State Machine
//!
//! Tracks one dialog from the first INVITE to its terminal state

use super::message::SipError;
use std::time::{Duration, Instant};

/// Call State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No INVITE exchanged yet
    Idle,
    /// INVITE sent, no provisional response yet
    Inviting,
    /// 100 Trying received
    Trying,
    /// 180/183 received, or we are ringing for an inbound INVITE
    Ringing,
    /// 200 OK exchanged and acknowledged
    Established,
    /// Our re-INVITE advertising a zero connection address was accepted
    OnHold,
    /// REFER accepted and the far end reported success
    Transferred,
    /// 486 Busy Here
    Busy,
    /// 503 after Trying
    NotFound,
    /// 503 after Ringing
    TemporarilyUnavailable,
    /// Declined, cancelled or rejected before answer
    Failed,
    /// BYE sent or received
    Terminated,
}

impl CallState {
    /// Terminal states end the dialog
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Busy
                | CallState::NotFound
                | CallState::TemporarilyUnavailable
                | CallState::Failed
                | CallState::Terminated
        )
    }

    /// Check if state is provisional
    pub fn is_provisional(&self) -> bool {
        matches!(
            self,
            CallState::Inviting | CallState::Trying | CallState::Ringing
        )
    }

    /// Check if call is established
    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Established | CallState::OnHold)
    }

    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Inviting => "Inviting",
            CallState::Trying => "Trying",
            CallState::Ringing => "Ringing",
            CallState::Established => "Established",
            CallState::OnHold => "OnHold",
            CallState::Transferred => "Transferred",
            CallState::Busy => "Busy",
            CallState::NotFound => "NotFound",
            CallState::TemporarilyUnavailable => "TemporarilyUnavailable",
            CallState::Failed => "Failed",
            CallState::Terminated => "Terminated",
        }
    }
}

/// Call Statistics
#[derive(Debug, Clone)]
pub struct CallStats {
    /// When the call was created
    pub created_at: Instant,
    /// When the call was answered (if applicable)
    pub answered_at: Option<Instant>,
    /// When the call ended (if applicable)
    pub ended_at: Option<Instant>,
    /// Number of provisional responses received/sent
    pub provisional_count: u32,
    /// Number of challenged requests re-sent with credentials
    pub auth_retries: u32,
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            answered_at: None,
            ended_at: None,
            provisional_count: 0,
            auth_retries: 0,
        }
    }

    /// Get call setup duration (time from created to answered)
    pub fn setup_duration(&self) -> Option<Duration> {
        self.answered_at.map(|t| t.duration_since(self.created_at))
    }

    /// Get call duration (time from answered to ended)
    pub fn call_duration(&self) -> Option<Duration> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some(ended.duration_since(answered)),
            _ => None,
        }
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Call State Machine Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// INVITE sent
    Invite,
    /// INVITE received and answered with 180
    IncomingInvite,
    /// 401/407 for our INVITE, re-sent with credentials
    Challenge,
    /// 100 Trying received
    Trying,
    /// 180/183 received
    Ringing,
    /// 200 OK sent/received
    Answer,
    /// 486 received
    Busy,
    /// 503 mapped from Trying
    NotFound,
    /// 503 mapped from Ringing
    Unavailable,
    /// Any other final failure, or a local rejection
    Reject,
    /// No final response in time
    Timeout,
    /// CANCEL sent/received
    Cancel,
    /// BYE sent/received
    Bye,
    /// Hold re-INVITE accepted
    Hold,
    /// Resume re-INVITE accepted
    Resume,
    /// Transfer completed
    Transfer,
}

/// State Machine
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    stats: CallStats,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            stats: CallStats::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Get statistics
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Process an event and transition state
    pub fn process_event(&mut self, event: CallEvent) -> Result<CallState, SipError> {
        use CallState::*;

        let new_state = match (self.state, event) {
            // Outbound setup
            (Idle, CallEvent::Invite) => Inviting,
            (Inviting, CallEvent::Challenge) => Inviting,
            (Inviting | Trying, CallEvent::Trying) => Trying,
            (Inviting | Trying | Ringing, CallEvent::Ringing) => Ringing,

            // Inbound setup
            (Idle, CallEvent::IncomingInvite) => Ringing,

            // Final responses before answer
            (Inviting | Trying | Ringing, CallEvent::Answer) => Established,
            (Inviting | Trying | Ringing, CallEvent::Busy) => Busy,
            (Inviting | Trying | Ringing, CallEvent::NotFound) => NotFound,
            (Inviting | Trying | Ringing, CallEvent::Unavailable) => TemporarilyUnavailable,
            (Inviting | Trying | Ringing, CallEvent::Reject) => Failed,
            (Inviting | Trying | Ringing, CallEvent::Timeout) => Terminated,
            (Inviting | Trying | Ringing | Established, CallEvent::Cancel) => Terminated,

            // Mid-call
            (Established, CallEvent::Hold) => OnHold,
            (OnHold, CallEvent::Resume) => Established,
            (Established | OnHold, CallEvent::Transfer) => Transferred,
            (Established | OnHold | Transferred, CallEvent::Bye) => Terminated,

            // Invalid transitions
            (state, event) => {
                return Err(SipError::InvalidStateTransition(format!(
                    "{} + {:?}",
                    state.name(),
                    event
                )))
            }
        };

        // Update statistics
        match event {
            CallEvent::Trying | CallEvent::Ringing => {
                self.stats.provisional_count += 1;
            }
            CallEvent::Challenge => {
                self.stats.auth_retries += 1;
            }
            CallEvent::Answer => {
                self.stats.answered_at = Some(Instant::now());
            }
            _ => {}
        }
        if new_state.is_terminal() {
            self.stats.ended_at = Some(Instant::now());
        }

        self.state = new_state;
        Ok(new_state)
    }

    /// Check if call can be answered
    pub fn can_answer(&self) -> bool {
        matches!(self.state, CallState::Ringing)
    }

    /// Check if a CANCEL still makes sense
    pub fn can_cancel(&self) -> bool {
        self.state.is_provisional()
    }

    /// Check if call can be terminated with BYE
    pub fn can_terminate(&self) -> bool {
        matches!(
            self.state,
            CallState::Established | CallState::OnHold | CallState::Transferred
        )
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
