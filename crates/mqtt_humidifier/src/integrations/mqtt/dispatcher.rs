//! Signal dispatcher.
//!
//! Components connect to a named signal and receive every payload sent on it
//! afterwards. The integration owns one dispatcher per payload type and hands
//! it to the platforms that need it, so there is no process-wide registry.

use std::collections::HashMap;

use tokio::sync::mpsc;

/// Signal announcing a newly discovered entity of `component`
pub fn discovery_new_signal(component: &str) -> String {
    format!("mqtt_discovery_new_{}_mqtt", component)
}

/// Named signals, each with any number of connected receivers
#[derive(Debug)]
pub struct Dispatcher<T> {
    signals: HashMap<String, Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            signals: HashMap::new(),
        }
    }
}

impl<T: Clone> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a signal. Dropping the receiver disconnects.
    pub fn connect(&mut self, signal: &str) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.signals.entry(signal.to_string()).or_default().push(tx);
        rx
    }

    /// Send a payload to every receiver connected to `signal`.
    ///
    /// Returns the number of receivers that got it; disconnected receivers
    /// are pruned along the way.
    pub fn send(&mut self, signal: &str, payload: T) -> usize {
        let Some(senders) = self.signals.get_mut(signal) else {
            return 0;
        };

        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            self.signals.remove(signal);
        }
        delivered
    }
}
