//! Event delivery to registered listeners
//!
//! Listeners run synchronously on the connection worker, in registration
//! order. A panicking listener is isolated: delivery continues to the
//! remaining listeners and the panic is surfaced as one nested Error event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::core::message::Message;
use crate::error::SockletError;

/// Lifecycle and data events observed by listeners. Immutable once built.
#[derive(Debug)]
pub enum Event {
    Open,
    Message(Message),
    Error(SockletError),
    Close { code: u16, reason: String },
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Dispatcher {
    listeners: Mutex<Vec<Listener>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, listener: Listener) {
        self.lock().push(listener);
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// A panic in a listener becomes a nested `Error(Listener)` event, at
    /// most once per failing listener per dispatch; panics while delivering
    /// the nested event (or a Close event, which must be final) are only
    /// logged.
    pub(crate) fn dispatch(&self, event: &Event) {
        let snapshot: Vec<Listener> = self.lock().clone();
        let mut panics = Vec::new();
        for (index, listener) in snapshot.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let what = describe_panic(&*panic);
                warn!("listener {} panicked during dispatch: {}", index, what);
                panics.push(what);
            }
        }
        // Never surface errors for a nested error event or after Close,
        // which must be the final event a listener observes
        if matches!(
            event,
            Event::Error(SockletError::Listener(_)) | Event::Close { .. }
        ) {
            return;
        }
        for what in panics {
            let nested = Event::Error(SockletError::Listener(what));
            self.dispatch_quiet(&nested, &snapshot);
        }
    }

    /// Nested delivery with no further error surfacing
    fn dispatch_quiet(&self, event: &Event, snapshot: &[Listener]) {
        for (index, listener) in snapshot.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                warn!(
                    "listener {} panicked during nested dispatch: {}",
                    index,
                    describe_panic(&*panic)
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_into(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        Arc::new(move |event: &Event| {
            let entry = match event {
                Event::Open => format!("{}:open", tag),
                Event::Message(m) => format!("{}:message:{}", tag, m.len()),
                Event::Error(e) => format!("{}:error:{}", tag, e),
                Event::Close { code, .. } => format!("{}:close:{}", tag, code),
            };
            log.lock().unwrap().push(entry);
        })
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add(record_into(log.clone(), "a"));
        dispatcher.add(record_into(log.clone(), "b"));

        dispatcher.dispatch(&Event::Open);
        dispatcher.dispatch(&Event::Message(Message::text("hi")));

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["a:open", "b:open", "a:message:2", "b:message:2"]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_block_later_listeners() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add(Arc::new(|event: &Event| {
            if matches!(event, Event::Open) {
                panic!("boom");
            }
        }));
        dispatcher.add(record_into(log.clone(), "b"));

        dispatcher.dispatch(&Event::Open);

        let entries = log.lock().unwrap().clone();
        // The surviving listener saw Open, then the nested listener error
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], "b:open");
        assert!(entries[1].starts_with("b:error:"));
        assert!(entries[1].contains("boom"));
    }

    #[test]
    fn test_always_panicking_listener_cannot_recurse() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = count.clone();
        dispatcher.add(Arc::new(move |_: &Event| {
            *count_clone.lock().unwrap() += 1;
            panic!("always");
        }));

        dispatcher.dispatch(&Event::Open);

        // Invoked once for Open and once for the single nested error event
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_no_error_event_after_close() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add(Arc::new(|event: &Event| {
            if matches!(event, Event::Close { .. }) {
                panic!("late panic");
            }
        }));
        dispatcher.add(record_into(log.clone(), "b"));

        dispatcher.dispatch(&Event::Close {
            code: 1000,
            reason: String::new(),
        });

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["b:close:1000"]);
    }
}
