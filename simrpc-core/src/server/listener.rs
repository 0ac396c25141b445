//! # Traffic Listener Bus
//!
//! Observers notified for every message a [`super::MockServer`] receives or sends.
//!
//! Callbacks run synchronously on the task of the call they observe, in transmission
//! order, so a slow listener delays that call. Recorders should hand the event off quickly.
use crate::message;
use prost_reflect::DynamicMessage;
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

/// Which way a message travelled, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// One observed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Traffic {
    /// Fully qualified method name, e.g. `helloworld.Greeter.SayHello`.
    pub method: String,
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    pub payload: Value,
}

pub trait Listener: Send + Sync + 'static {
    fn on_message(&self, traffic: &Traffic);
}

impl<F> Listener for F
where
    F: Fn(&Traffic) + Send + Sync + 'static,
{
    fn on_message(&self, traffic: &Traffic) {
        self(traffic)
    }
}

/// An append-only, ordered list of listeners.
///
/// Cloning yields a handle to the same list.
#[derive(Clone, Default)]
pub struct ListenerBus {
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
}

impl ListenerBus {
    pub fn add(&self, listener: Arc<dyn Listener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Notifies every listener in registration order.
    pub fn publish(&self, traffic: &Traffic) {
        // Callbacks run outside the lock so they may register further listeners.
        let snapshot = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            listener.on_message(traffic);
        }
    }
}

impl fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerBus")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Publishes the traffic of a single call.
#[derive(Debug, Clone)]
pub(crate) struct CallObserver {
    bus: ListenerBus,
    method: String,
    peer: String,
    local: String,
}

impl CallObserver {
    pub(crate) fn new(bus: ListenerBus, method: String, peer: String, local: String) -> Self {
        Self {
            bus,
            method,
            peer,
            local,
        }
    }

    pub(crate) fn inbound(&self, message: &DynamicMessage) {
        self.publish(Direction::In, message);
    }

    pub(crate) fn outbound(&self, message: &DynamicMessage) {
        self.publish(Direction::Out, message);
    }

    fn publish(&self, direction: Direction, message: &DynamicMessage) {
        if self.bus.is_empty() {
            return;
        }

        let payload = message::to_json(message).unwrap_or_else(|err| {
            tracing::warn!(method = %self.method, error = %err, "failed to render observed message");
            Value::Null
        });

        let (source, destination) = match direction {
            Direction::In => (self.peer.clone(), self.local.clone()),
            Direction::Out => (self.local.clone(), self.peer.clone()),
        };

        tracing::debug!(method = %self.method, %direction, "observed message");

        self.bus.publish(&Traffic {
            method: self.method.clone(),
            direction,
            source,
            destination,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn traffic(direction: Direction) -> Traffic {
        Traffic {
            method: "helloworld.Greeter.SayHello".to_string(),
            direction,
            source: "127.0.0.1:1".to_string(),
            destination: "127.0.0.1:2".to_string(),
            payload: json!({ "name": "X" }),
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = ListenerBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = seen.clone();
            bus.add(Arc::new(move |t: &Traffic| {
                seen.lock().unwrap().push((id, t.direction));
            }));
        }

        bus.publish(&traffic(Direction::In));
        bus.publish(&traffic(Direction::Out));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (0, Direction::In),
                (1, Direction::In),
                (2, Direction::In),
                (0, Direction::Out),
                (1, Direction::Out),
                (2, Direction::Out),
            ]
        );
    }

    #[test]
    fn a_listener_may_register_another_while_notified() {
        let bus = ListenerBus::default();
        let inner = bus.clone();

        bus.add(Arc::new(move |_: &Traffic| {
            inner.add(Arc::new(|_: &Traffic| {}));
        }));

        bus.publish(&traffic(Direction::In));
        assert_eq!(bus.len(), 2);

        bus.clear();
        assert!(bus.is_empty());
    }

    #[test]
    fn traffic_serializes_lowercase_directions() {
        let json = serde_json::to_value(traffic(Direction::Out)).unwrap();
        assert_eq!(json["direction"], json!("out"));
        assert_eq!(json["payload"], json!({ "name": "X" }));
    }
}
