//! SIP user agent signaling
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │       UserAgent         │
//! │  (operations, refresh)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  Transaction controllers│
//! │ (REGISTER, INVITE, ...) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │ Dispatcher + Router     │
//! │ (Call-ID, CSeq method)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │      Transport          │
//! │    (UDP, channel)       │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_state;
pub mod context;
pub mod counter;
pub mod dialog;
pub mod dispatcher;
pub mod handler;
pub mod hold;
pub mod invite;
pub mod keepalive;
pub mod message;
pub mod messaging;
pub mod register;
pub mod router;
pub mod sdp;
pub mod teardown;
pub mod template;
pub mod transaction;
pub mod transfer;
pub mod transport;
pub mod user_agent;

pub use auth::{AuthInfo, DigestCalculator, DigestMethod};
pub use call_state::{CallEvent, CallState, CallStateMachine, CallStats};
pub use counter::{IdGenerator, SequenceCounter, TagPool};
pub use dialog::{Dialog, DialogRegistry, InviteProgress};
pub use dispatcher::{ResponseDispatcher, TransactionKey};
pub use handler::{CallHandler, RegistrationHandler};
pub use invite::InviteOutcome;
pub use keepalive::{KeepaliveMonitor, OptionsVerdict, StatusReporter};
pub use message::{AuthChallenge, ChallengeKind, MessageKind, SipError, SipMessage, SipMethod};
pub use register::Registration;
pub use transfer::Replaces;
pub use transport::{ChannelPeer, ChannelTransport, Transport, UdpTransport};
pub use user_agent::{UserAgent, UserAgentBuilder};
