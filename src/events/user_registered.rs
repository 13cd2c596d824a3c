//! Emitted once a user account has been created.

use crate::event_bus::Event;

/// A user completed signup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRegistered {
    /// The new user
    pub user_id: String,
}

impl Event for UserRegistered {
    const NAME: &'static str = "UserRegistered";
}
