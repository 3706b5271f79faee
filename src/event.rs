//! Run lifecycle events.
//!
//! There is no global subscriber registry: the run creates one [`EventBus`]
//! and every VU receives it together with a bus of its own.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TestStart,
    IterationStart {
        vu_id: u64,
        iteration: u64,
        scenario: String,
    },
    IterationEnd {
        vu_id: u64,
        iteration: u64,
        scenario: String,
        error: Option<String>,
    },
    /// The run is shutting down; `error` is set when it was aborted.
    Exit { error: Option<String> },
    TestEnd,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

/// The buses a VU can observe.
#[derive(Debug, Clone, Default)]
pub struct Events {
    pub global: EventBus,
    pub local: EventBus,
}

impl Events {
    /// A fresh local bus attached to the run's global one.
    pub fn for_vu(global: &EventBus) -> Self {
        Self {
            global: global.clone(),
            local: EventBus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(Event::TestStart), 0);
    }

    #[tokio::test]
    async fn local_buses_are_isolated() {
        let global = EventBus::default();
        let a = Events::for_vu(&global);
        let b = Events::for_vu(&global);

        let mut global_rx = global.subscribe();
        let mut b_rx = b.local.subscribe();

        a.global.emit(Event::TestEnd);
        a.local.emit(Event::Exit { error: None });

        assert_eq!(global_rx.recv().await.unwrap(), Event::TestEnd);
        assert!(b_rx.try_recv().is_err());
    }
}
