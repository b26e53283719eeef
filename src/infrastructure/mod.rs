//! Infrastructure layer - protocol implementations

pub mod protocols;
