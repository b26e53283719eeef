//! Signaling protocols

pub mod sip;
