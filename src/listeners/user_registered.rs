//! Welcomes new users by email.

use std::sync::Arc;

use crate::event_bus::EventBus;
use crate::events::user_registered::UserRegistered;
use crate::jobs::send_welcome_email::{self, SendWelcomeEmailPayload};
use crate::queue::QueueRegistry;

/// Send every new user a welcome email.
pub fn register(bus: &mut EventBus, queues: &Arc<QueueRegistry>) {
    let queues = queues.clone();
    bus.on(move |event: Arc<UserRegistered>| {
        let queues = queues.clone();
        async move {
            let payload = SendWelcomeEmailPayload {
                user_id: event.user_id.clone(),
            };
            send_welcome_email::definition()
                .dispatch(&queues, &payload)
                .await?;
            Ok(())
        }
    });
}
