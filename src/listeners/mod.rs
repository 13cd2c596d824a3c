//! Listeners turning domain events into job dispatches.
//!
//! `jobqueue make listener` adds new modules here and wires them up in
//! [`register_all`].

use std::sync::Arc;

use crate::event_bus::EventBus;
use crate::queue::QueueRegistry;

pub mod user_registered;

/// Register every listener of the application on `bus`.
pub fn register_all(bus: &mut EventBus, queues: &Arc<QueueRegistry>) {
    user_registered::register(bus, queues);
}
