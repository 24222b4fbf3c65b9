use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use pigeon_types::events::{EventScope, GatewayEvent};

/// An event together with the scopes it is addressed to. A connection
/// receives it when any scope matches — once, even if several do.
#[derive(Debug, Clone)]
pub struct ScopedEvent {
    pub scopes: Vec<EventScope>,
    pub event: GatewayEvent,
}

impl ScopedEvent {
    /// Whether a connection owned by `user_id` with the given conversation
    /// subscriptions should receive this event.
    pub fn matches(&self, user_id: Uuid, subscriptions: &HashSet<Uuid>) -> bool {
        self.scopes.iter().any(|scope| match scope {
            EventScope::Conversation(id) => subscriptions.contains(id),
            EventScope::User(id) => *id == user_id,
        })
    }
}

/// Manages all live connections: scoped event fan-out plus the per-user
/// connection counting that presence is derived from.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// All connections listen here and filter by scope. Best-effort: a
    /// lagged receiver drops events and the client catches up via the
    /// message-list cursor.
    broadcast_tx: broadcast::Sender<ScopedEvent>,

    /// Live connections per user. A user is online while this entry is
    /// non-empty; only connect/disconnect mutate it.
    connections: RwLock<HashMap<Uuid, Vec<(Uuid, mpsc::UnboundedSender<GatewayEvent>)>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the scoped event stream. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ScopedEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish an event to a set of scopes. Events published to the same
    /// scope reach a given subscriber in publish order.
    pub fn publish(&self, scopes: Vec<EventScope>, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(ScopedEvent { scopes, event });
    }

    /// Register a new connection for a user. Returns the connection id, the
    /// targeted receiver, and whether this was the user's first live
    /// connection (the 0 -> 1 presence transition).
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut connections = self.inner.connections.write().await;
        let entry = connections.entry(user_id).or_default();
        let went_online = entry.is_empty();
        entry.push((conn_id, tx));

        (conn_id, rx, went_online)
    }

    /// Drop a connection. Returns true on the 1 -> 0 transition, i.e. the
    /// user's last connection closed and they are now offline.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        let Some(entry) = connections.get_mut(&user_id) else {
            return false;
        };
        entry.retain(|(id, _)| *id != conn_id);

        if entry.is_empty() {
            connections.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Send a targeted event to every live connection of one user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(entry) = connections.get(&user_id) {
            for (_, tx) in entry {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Whether the user has any live connection.
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pigeon_types::models::DeliveryStatus;

    fn status_event(conversation_id: Uuid) -> GatewayEvent {
        GatewayEvent::MessageStatus {
            message_id: Uuid::new_v4(),
            conversation_id,
            status: DeliveryStatus::Delivered,
        }
    }

    #[test]
    fn matching_covers_both_scope_kinds() {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let mut subs = HashSet::new();

        let conv_scoped = ScopedEvent {
            scopes: vec![EventScope::Conversation(conv)],
            event: status_event(conv),
        };
        assert!(!conv_scoped.matches(me, &subs));
        subs.insert(conv);
        assert!(conv_scoped.matches(me, &subs));

        let user_scoped = ScopedEvent {
            scopes: vec![EventScope::User(me)],
            event: status_event(conv),
        };
        assert!(user_scoped.matches(me, &HashSet::new()));
        assert!(!user_scoped.matches(Uuid::new_v4(), &HashSet::new()));
    }

    #[tokio::test]
    async fn connection_count_drives_presence_transitions() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (first_conn, _rx1, went_online) = dispatcher.register(user).await;
        assert!(went_online);
        assert!(dispatcher.is_online(user).await);

        let (second_conn, _rx2, went_online) = dispatcher.register(user).await;
        assert!(!went_online);

        // Closing one of two tabs keeps the user online.
        assert!(!dispatcher.unregister(user, first_conn).await);
        assert!(dispatcher.is_online(user).await);

        assert!(dispatcher.unregister(user, second_conn).await);
        assert!(!dispatcher.is_online(user).await);
    }

    #[tokio::test]
    async fn published_events_reach_subscribers_in_order() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let mut rx = dispatcher.subscribe();

        for _ in 0..3 {
            dispatcher.publish(vec![EventScope::Conversation(conv)], status_event(conv));
        }

        for _ in 0..3 {
            let scoped = rx.recv().await.unwrap();
            assert_eq!(scoped.scopes, vec![EventScope::Conversation(conv)]);
        }
    }

    #[tokio::test]
    async fn targeted_send_reaches_every_session_of_a_user() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();

        let (_c1, mut rx1, _) = dispatcher.register(user).await;
        let (_c2, mut rx2, _) = dispatcher.register(user).await;

        dispatcher.send_to_user(user, status_event(conv)).await;

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
