//! sipagent - a SIP user agent for a single account on one server
//!
//! Registers, places and receives calls, holds, transfers and hangs up, and
//! keeps track of whether the registration is still alive.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::Config;
pub use domain::call::{CallStatus, CallUpdate, MediaDescription, TransmitMode};
pub use infrastructure::protocols::sip::{SipError, UserAgent, UserAgentBuilder};
