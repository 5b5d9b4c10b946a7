//! `LISTEN`/`NOTIFY` channel registry: a map from channel name to its
//! subscriber broadcast, independent of connection identity so it survives
//! reconnect. The wire replays `LISTEN` for every registered name after a
//! fresh connect; the registry itself never needs to know a reconnect
//! happened.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

/// One delivered `NotificationResponse`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub process_id: i32,
}

struct Channel {
    sender: broadcast::Sender<Notification>,
}

/// Name -> channel. At most one entry per name.
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

/// Shared across the reader task (which dispatches notifications) and
/// every call to `listen`/`unlisten`/reconnect-replay.
pub type SharedChannelRegistry = Arc<Mutex<ChannelRegistry>>;

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry { channels: HashMap::new() }
    }

    /// Subscribe to `name`. Returns `(needs_listen, receiver)`: `needs_listen`
    /// is true the first time `name` is registered, telling the caller to
    /// issue `LISTEN` on the wire; false if another subscriber already did.
    pub fn subscribe(&mut self, name: &str) -> (bool, broadcast::Receiver<Notification>) {
        if let Some(channel) = self.channels.get(name) {
            return (false, channel.sender.subscribe());
        }
        let (sender, receiver) = broadcast::channel(256);
        self.channels.insert(name.to_string(), Channel { sender });
        (true, receiver)
    }

    /// Remove `name` from the registry; returns whether it was present (the
    /// caller only issues `UNLISTEN` when it was).
    pub fn unsubscribe(&mut self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    pub fn dispatch(&self, notification: Notification) {
        if let Some(channel) = self.channels.get(&notification.channel) {
            // No subscribers left is not an error: `send` only fails when
            // the receiver count is zero, which just means nobody's
            // listening client-side right now.
            let _ = channel.sender.send(notification);
        }
    }

    /// Every currently registered channel name, for reconnect replay.
    pub fn registered_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_needs_listen_second_does_not() {
        let mut reg = ChannelRegistry::new();
        let (needs_listen, _rx) = reg.subscribe("events");
        assert!(needs_listen);
        let (needs_listen, _rx) = reg.subscribe("events");
        assert!(!needs_listen);
    }

    #[tokio::test]
    async fn dispatch_delivers_to_all_subscribers_in_order() {
        let mut reg = ChannelRegistry::new();
        let (_, mut rx1) = reg.subscribe("events");
        let (_, mut rx2) = reg.subscribe("events");
        for i in 0..5 {
            reg.dispatch(Notification { channel: "events".into(), payload: i.to_string(), process_id: 1 });
        }
        for i in 0..5 {
            assert_eq!(rx1.recv().await.unwrap().payload, i.to_string());
            assert_eq!(rx2.recv().await.unwrap().payload, i.to_string());
        }
    }

    #[test]
    fn unsubscribe_reports_whether_it_existed() {
        let mut reg = ChannelRegistry::new();
        assert!(!reg.unsubscribe("ghost"));
        reg.subscribe("events");
        assert!(reg.unsubscribe("events"));
        assert!(!reg.unsubscribe("events"));
    }

    #[test]
    fn registered_names_reflects_current_subscriptions() {
        let mut reg = ChannelRegistry::new();
        reg.subscribe("a");
        reg.subscribe("b");
        let mut names = reg.registered_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
