//! Call bounded context - what the application sees of a call

pub mod event;
pub mod value_object;

pub use event::{CallStatus, CallUpdate};
pub use value_object::{CallDirection, Codec, MediaDescription, MediaStream, TransmitMode};
