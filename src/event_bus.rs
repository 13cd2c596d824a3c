//! In-process publish/subscribe for domain events.
//!
//! Events are not persisted: if nobody listens when an event is emitted, it
//! is gone. Listeners that need durability should dispatch a job.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::errors::{EmitError, HandlerFailure};
use crate::util::try_to_extract_panic_info;

/// A domain event that can be emitted on an [`EventBus`].
pub trait Event: Send + Sync + 'static {
    /// Name used in logs and errors.
    const NAME: &'static str;
}

type Handler<E> = Box<dyn Fn(Arc<E>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Handlers<E>(Vec<Handler<E>>);

/// Maps event types to the handlers registered for them, in registration order.
#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: HashMap<TypeId, &'static str>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut events: Vec<_> = self.names.values().collect();
        events.sort_unstable();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

impl EventBus {
    /// Create a bus without handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the handlers of `E`.
    ///
    /// Registering the same handler twice makes it run twice per event.
    pub fn on<E, F, Fut>(&mut self, handler: F)
    where
        E: Event,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let type_id = TypeId::of::<E>();
        self.names.insert(type_id, E::NAME);

        let boxed: Handler<E> = Box::new(move |event| handler(event).boxed());
        let entry = self
            .handlers
            .entry(type_id)
            .or_insert_with(|| Box::new(Handlers::<E>(Vec::new())));

        // Entries are keyed by the type id of their own event type.
        if let Some(handlers) = entry.downcast_mut::<Handlers<E>>() {
            handlers.0.push(boxed);
        }
    }

    /// Number of handlers registered for `E`.
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers_for::<E>().map_or(0, |handlers| handlers.0.len())
    }

    fn handlers_for<E: Event>(&self) -> Option<&Handlers<E>> {
        self.handlers
            .get(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_ref::<Handlers<E>>())
    }

    /// Invoke every handler of `E`, in registration order.
    ///
    /// Each handler is called synchronously; the future it returns runs as a
    /// spawned task, so this must be called from within a Tokio runtime.
    /// Failures are logged. Await [`Emission::wait`] to observe them as well.
    pub fn emit<E: Event>(&self, event: E) -> Emission {
        let event = Arc::new(event);
        let mut emission = Emission {
            event: E::NAME,
            tasks: Vec::new(),
            failures: Vec::new(),
        };

        let Some(handlers) = self.handlers_for::<E>() else {
            debug!(event = E::NAME, "Emitted event without handlers");
            return emission;
        };

        for (index, handler) in handlers.0.iter().enumerate() {
            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
            let future = match invoked {
                Ok(future) => future,
                Err(panic) => {
                    let message = format!("panicked: {}", try_to_extract_panic_info(&*panic));
                    warn!(event = E::NAME, handler = index, "Event handler failed: {message}");
                    emission.failures.push(HandlerFailure { index, message });
                    continue;
                }
            };

            let span = info_span!("event_handler", event = E::NAME, handler = index);
            let task = tokio::spawn(
                async move {
                    let outcome = AssertUnwindSafe(future).catch_unwind().await;
                    let message = match outcome {
                        Ok(Ok(())) => return Ok(()),
                        Ok(Err(error)) => format!("{error:#}"),
                        Err(panic) => format!("panicked: {}", try_to_extract_panic_info(&*panic)),
                    };
                    warn!("Event handler failed: {message}");
                    Err(message)
                }
                .instrument(span),
            );
            emission.tasks.push((index, task));
        }

        emission
    }
}

/// The handler tasks started by one [`EventBus::emit`] call.
///
/// Dropping the emission leaves the tasks running.
#[derive(Debug)]
pub struct Emission {
    event: &'static str,
    tasks: Vec<(usize, JoinHandle<Result<(), String>>)>,
    failures: Vec<HandlerFailure>,
}

impl Emission {
    /// Number of handlers that were started.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.failures.len()
    }

    /// Whether the event had no handlers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every handler to finish.
    pub async fn wait(self) -> Result<(), EmitError> {
        let mut failures = self.failures;
        for (index, task) in self.tasks {
            let message = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => message,
                Err(error) => error.to_string(),
            };
            failures.push(HandlerFailure { index, message });
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|failure| failure.index);
        Err(EmitError {
            event: self.event,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct UserSignedUp {
        user_id: String,
    }

    impl Event for UserSignedUp {
        const NAME: &'static str = "UserSignedUp";
    }

    struct Unrelated;

    impl Event for Unrelated {
        const NAME: &'static str = "Unrelated";
    }

    fn recorder(
        bus: &mut EventBus,
        seen: &Arc<Mutex<Vec<(usize, String)>>>,
        index: usize,
    ) {
        let seen = seen.clone();
        bus.on(move |event: Arc<UserSignedUp>| {
            seen.lock().unwrap().push((index, event.user_id.clone()));
            async { Ok(()) }
        });
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        recorder(&mut bus, &seen, 1);
        recorder(&mut bus, &seen, 2);

        let emission = bus.emit(UserSignedUp {
            user_id: "u-1".into(),
        });
        assert_eq!(emission.len(), 2);
        assert_ok!(emission.wait().await);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "u-1".to_string()), (2, "u-1".to_string())]
        );
    }

    #[tokio::test]
    async fn duplicate_registrations_run_twice() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        recorder(&mut bus, &seen, 0);
        recorder(&mut bus, &seen, 0);

        bus.emit(UserSignedUp {
            user_id: "u-2".into(),
        })
        .wait()
        .await
        .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bus.handler_count::<UserSignedUp>(), 2);
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on(|_: Arc<UserSignedUp>| async { anyhow::bail!("smtp unavailable") });
        bus.on(|_: Arc<UserSignedUp>| -> futures_util::future::Ready<anyhow::Result<()>> {
            panic!("listener bug")
        });
        recorder(&mut bus, &seen, 2);

        let error = assert_err!(
            bus.emit(UserSignedUp {
                user_id: "u-3".into(),
            })
            .wait()
            .await
        );

        assert_eq!(error.event, "UserSignedUp");
        assert_eq!(error.failures.len(), 2);
        assert_eq!(error.failures[0].index, 0);
        assert_eq!(error.failures[0].message, "smtp unavailable");
        assert_eq!(error.failures[1].index, 1);
        assert!(error.failures[1].message.contains("listener bug"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_without_handlers_are_dropped() {
        let bus = EventBus::new();
        let emission = bus.emit(Unrelated);
        assert!(emission.is_empty());
        assert_ok!(emission.wait().await);
    }
}
