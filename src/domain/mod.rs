//! Domain layer - call concepts shared between the agent and its application

pub mod call;
