//! In-process publish/subscribe bus.
//!
//! Decouples the monitor (which requests rebuilds), the pipeline (which
//! reports stage progress) and whatever presents that progress. Every
//! callback runs on its own thread, so subscribers must not assume mutual
//! exclusion with each other or with the publisher.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use crate::pipeline::StageStatus;

/// Channels an [`Event`] can be published on.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Topic {
    /// A relevant filesystem change occurred.
    RebuildRequested,
    /// A pipeline was built; carries its commands in display order.
    CommandList,
    /// A stage changed state.
    StageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RebuildRequested,
    CommandList(Vec<String>),
    StageStatus(StageStatus),
}

impl Event {
    pub const fn topic(&self) -> Topic {
        match self {
            Self::RebuildRequested => Topic::RebuildRequested,
            Self::CommandList(_) => Topic::CommandList,
            Self::StageStatus(_) => Topic::StageStatus,
        }
    }
}

type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Cloning an `Exchange` yields another handle onto the same subscriber table.
#[derive(Clone, Default)]
pub struct Exchange {
    queues: Arc<RwLock<HashMap<Topic, Vec<Callback>>>>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts: Vec<_> = queues.iter().map(|(t, q)| (*t, q.len())).collect();
        counts.sort_by_key(|(t, _)| format!("{:?}", t));
        f.debug_struct("Exchange").field("listeners", &counts).finish()
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every future publish on `topic`.
    ///
    /// Registrations are kept in order and can't be removed.
    pub fn listen<F>(&self, topic: Topic, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(topic)
            .or_insert_with(Vec::new)
            .push(Arc::new(callback));
    }

    /// Hands `event` to every callback registered on its topic, each on a
    /// fresh thread. Returns without waiting for the callbacks.
    ///
    /// Returns how many callbacks were dispatched.
    pub fn send(&self, event: Event) -> usize {
        let topic = event.topic();
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let callbacks = match queues.get(&topic) {
            Some(callbacks) => callbacks,
            None => {
                trace!("No listeners for {:?}", topic);
                return 0;
            }
        };

        let mut dispatched = 0;
        for callback in callbacks {
            let callback = Arc::clone(callback);
            let event = event.clone();
            let spawned = thread::Builder::new()
                .name(format!("exchange-{:?}", topic))
                .spawn(move || callback(event));

            match spawned {
                Ok(_) => dispatched += 1,
                Err(err) => error!("Couldn't dispatch {:?}: {}", topic, err),
            }
        }

        dispatched
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues.get(&topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, Exchange, Topic};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn delivers_payload_to_every_listener() {
        let exchange = Exchange::new();
        let (tx, rx) = channel();

        for id in 0..3 {
            let tx = tx.clone();
            exchange.listen(Topic::CommandList, move |event| {
                tx.send((id, event)).unwrap();
            });
        }

        let payload = Event::CommandList(vec!["make".into(), "make test".into()]);
        assert_eq!(exchange.send(payload.clone()), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (id, event) = rx.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(event, payload);
            seen.push(id);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn other_topics_are_not_invoked() {
        let exchange = Exchange::new();
        let (tx, rx) = channel();

        let status_tx = tx.clone();
        exchange.listen(Topic::StageStatus, move |_| {
            status_tx.send("status").unwrap();
        });
        exchange.listen(Topic::RebuildRequested, move |_| {
            tx.send("rebuild").unwrap();
        });

        assert_eq!(exchange.send(Event::RebuildRequested), 1);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "rebuild");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn send_without_listeners_is_a_no_op() {
        let exchange = Exchange::new();
        assert_eq!(exchange.send(Event::RebuildRequested), 0);
    }

    #[test]
    fn clones_share_listeners() {
        let exchange = Exchange::new();
        let other = exchange.clone();
        let (tx, rx) = channel();

        other.listen(Topic::RebuildRequested, move |_| tx.send(()).unwrap());
        assert_eq!(exchange.listener_count(Topic::RebuildRequested), 1);

        exchange.send(Event::RebuildRequested);
        assert!(rx.recv_timeout(TIMEOUT).is_ok());
    }
}
