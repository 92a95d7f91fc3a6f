//! Well-known Gmail label identifiers

/// Gmail label ID constants consulted at parse time
pub struct LabelId;

impl LabelId {
    pub const SENT: &'static str = "SENT";
    pub const UNREAD: &'static str = "UNREAD";
}
