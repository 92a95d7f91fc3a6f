//! Remote mailbox capability
//!
//! The sync engine talks to the remote mailbox only through [`MailboxApi`].
//! [`GmailClient`](crate::gmail::GmailClient) is the production
//! implementation; [`InMemoryMailbox`] is the test double.

mod error;
mod memory;
mod traits;

pub use error::ApiError;
pub use memory::{InMemoryMailbox, simple_message};
pub use traits::{IdPage, MailboxApi};
