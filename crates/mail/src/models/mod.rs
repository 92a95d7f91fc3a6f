//! Domain models for mirrored mail

mod label;
mod message;

pub use label::LabelId;
pub use message::{EmailAddress, Message, MessageBuilder, MessageId, Recipients, ThreadId};
