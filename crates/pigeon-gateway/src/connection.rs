use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use pigeon_db::Database;
use pigeon_types::events::{EventScope, GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, Ready, then
/// the event loop until either side closes.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register this connection; `went_online` marks the 0 -> 1 transition.
    let (conn_id, mut user_rx, went_online) = dispatcher.register(user_id).await;

    // Send the current presence of this user's conversation partners so the
    // client starts from a consistent snapshot.
    if let Ok(partners) = partner_ids(&db, user_id).await {
        for partner in &partners {
            let event = GatewayEvent::PresenceUpdate {
                user_id: *partner,
                online: dispatcher.is_online(*partner).await,
                last_seen_at: last_seen(&db, *partner).await,
            };
            if sender
                .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                .await
                .is_err()
            {
                dispatcher.unregister(user_id, conn_id).await;
                return;
            }
        }
    }

    if went_online {
        publish_presence(&dispatcher, &db, user_id, true).await;
    }

    // Subscribe to the scoped event stream and relay matches to this client
    let mut broadcast_rx = dispatcher.subscribe();
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();

    // Per-connection conversation subscriptions (shared between send and
    // recv tasks).
    let subscriptions: Arc<std::sync::RwLock<HashSet<Uuid>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward scoped broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let scoped = match result {
                        Ok(scoped) => scoped,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !scoped.matches(user_id, &subs) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&scoped.event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<GatewayCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(
                                &dispatcher_recv,
                                &db_recv,
                                user_id,
                                &username_recv,
                                cmd,
                                &recv_subscriptions,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                username_recv,
                                user_id,
                                e,
                                truncate_chars(&text, 200)
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let went_offline = dispatcher.unregister(user_id, conn_id).await;
    if went_offline {
        // Stamp last-seen at the moment the final connection closed, then
        // tell this user's conversation partners.
        let now = Utc::now();
        let db_stamp = db.clone();
        let stamp = tokio::task::spawn_blocking(move || {
            db_stamp.set_last_seen(&user_id.to_string(), &now.to_rfc3339())
        })
        .await;
        match stamp {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to stamp last_seen for {}: {}", user_id, e),
            Err(e) => warn!("spawn_blocking join error: {}", e),
        }

        publish_presence(&dispatcher, &db, user_id, false).await;
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use pigeon_types::api::Claims;

    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    subscriptions: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { conversation_ids } => {
            // Only conversations this user participates in are accepted;
            // anything else is silently dropped.
            let allowed = filter_own_conversations(db, user_id, conversation_ids).await;
            info!(
                "{} ({}) subscribing to {} conversations",
                username,
                user_id,
                allowed.len()
            );
            let mut subs = subscriptions.write().expect("subscription lock poisoned");
            *subs = allowed.into_iter().collect();
        }

        GatewayCommand::StartTyping { conversation_id } => {
            let is_subscribed = {
                let subs = subscriptions.read().expect("subscription lock poisoned");
                subs.contains(&conversation_id)
            };
            if is_subscribed {
                dispatcher.publish(
                    vec![EventScope::Conversation(conversation_id)],
                    GatewayEvent::TypingStart {
                        conversation_id,
                        user_id,
                    },
                );
            }
        }
    }
}

/// Keep only the conversations the user is a participant of.
async fn filter_own_conversations(
    db: &Arc<Database>,
    user_id: Uuid,
    conversation_ids: Vec<Uuid>,
) -> Vec<Uuid> {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let uid = user_id.to_string();
        let mut allowed = Vec::with_capacity(conversation_ids.len());
        for conversation_id in conversation_ids {
            match db.get_conversation(&conversation_id.to_string()) {
                Ok(Some(row)) if row.first_user_id == uid || row.second_user_id == uid => {
                    allowed.push(conversation_id);
                }
                Ok(_) => {}
                Err(e) => warn!("Subscription lookup failed: {}", e),
            }
        }
        allowed
    })
    .await;

    match result {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            Vec::new()
        }
    }
}

/// Deliver a presence transition to the user's conversation partners and to
/// the user's own other sessions through the targeted per-user channels —
/// never a global broadcast.
async fn publish_presence(dispatcher: &Dispatcher, db: &Arc<Database>, user_id: Uuid, online: bool) {
    let partners = match partner_ids(db, user_id).await {
        Ok(partners) => partners,
        Err(e) => {
            warn!("Partner lookup failed for {}: {}", user_id, e);
            return;
        }
    };

    let last_seen_at = if online { None } else { last_seen(db, user_id).await };

    let event = GatewayEvent::PresenceUpdate {
        user_id,
        online,
        last_seen_at,
    };

    for partner in partners {
        dispatcher.send_to_user(partner, event.clone()).await;
    }
    dispatcher.send_to_user(user_id, event).await;
}

async fn partner_ids(db: &Arc<Database>, user_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
    let db = db.clone();
    let ids = tokio::task::spawn_blocking(move || db.partner_ids(&user_id.to_string()))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
}

async fn last_seen(db: &Arc<Database>, user_id: Uuid) -> Option<DateTime<Utc>> {
    let db = db.clone();
    let row = tokio::task::spawn_blocking(move || db.get_user_by_id(&user_id.to_string()))
        .await
        .ok()?
        .ok()?;

    row?.last_seen_at
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Cut a string to at most `max` characters, respecting char boundaries.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
