//! Domain events emitted by the application.

pub mod user_registered;
