//! Storage traits and implementations
//!
//! The sync engine persists through [`MailStore`]. [`SqliteMailStore`] is
//! the production store; [`InMemoryMailStore`] backs tests.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMailStore;
pub use sqlite::SqliteMailStore;
pub use traits::MailStore;

/// Database file name inside the data directory
pub const DATABASE_FILE_NAME: &str = "messages.db";
