// Per-connection state machine: demultiplexes the client's framed command
// stream, enforces admission/rate-limit policy, owns subscriptions, and
// serializes outbound frames (spec.md §4.1). The `tokio::select!` loop below
// is modeled directly on the teacher's `ws_forwarder::handle_forwarder_socket`
// (hello/heartbeat/event-batch/command-channel arms), generalized from a
// forwarder device session to a relay client session. Unlike the teacher,
// there is no separate writer task: this task owns both halves of the split
// socket, so ownership itself is the single send-serialization lock spec.md
// §4.1 calls for — no explicit mutex is needed.

use crate::ban::SessionLimiter;
use crate::config::RelayConfig;
use crate::node::{Node, SessionHandle};
use crate::processor::Processor;
use crate::store::Store;
use crate::validator::{self, DeletionTargetLookup, ValidatorConfig};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ClientMessage, Event, EventClass, Filter, RelayMessage};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

const READ_DEADLINE: Duration = Duration::from_secs(120);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const LIFETIME_CAP: Duration = Duration::from_secs(24 * 60 * 60);
const OUTBOUND_CHANNEL_DEPTH: usize = 100;
const MAX_ADVISORY_DENIALS: u32 = 5;
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(10);
const FRAME_WRITE_DEADLINE: Duration = Duration::from_secs(10);
const CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(2);
const SEEN_SET_TTL: Duration = Duration::from_secs(10);

pub struct SessionDeps {
    pub node: Arc<Node>,
    pub processor: Arc<Processor>,
    pub store: Arc<Store>,
    pub validator_config: Arc<ValidatorConfig>,
    pub relay_config: Arc<RelayConfig>,
}

struct MapTargets(HashMap<String, String>);
impl DeletionTargetLookup for MapTargets {
    fn pubkey_of(&self, target_id: &str) -> Option<String> {
        self.0.get(target_id).cloned()
    }
}

fn is_advisory(msg: &RelayMessage) -> bool {
    matches!(msg, RelayMessage::Notice { .. } | RelayMessage::Ok { .. } | RelayMessage::Closed { .. })
}

pub async fn run(socket: WebSocket, remote_addr: IpAddr, deps: SessionDeps) {
    let session_id = Uuid::new_v4();
    let subscriptions = Arc::new(RwLock::new(HashMap::<String, Vec<Filter>>::new()));
    // Short-lived per-subscription replay dedup (spec.md §4.5): seeded with
    // the ids a REQ's historical query already delivered, consulted once by
    // the live path below, then drained id-by-id as each is matched.
    let seen: Arc<RwLock<HashMap<String, HashSet<String>>>> = Arc::new(RwLock::new(HashMap::new()));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RelayMessage>(OUTBOUND_CHANNEL_DEPTH);

    deps.node
        .register_session(
            session_id,
            SessionHandle { outbound: outbound_tx.clone(), subscriptions: subscriptions.clone() },
        )
        .await;

    let cfg = &deps.relay_config.throttling;
    let limiter = SessionLimiter::new(
        cfg.rate_limit.max_events_per_second,
        cfg.rate_limit.max_requests_per_second,
        cfg.rate_limit.burst_size,
    );
    let violations = AtomicU32::new(0);
    let mut consecutive_advisory_denials = 0u32;

    let (mut sink, mut stream) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let start = Instant::now();

    'session: loop {
        if start.elapsed() > LIFETIME_CAP {
            break;
        }
        tokio::select! {
            _ = ping_interval.tick() => {
                match tokio::time::timeout(PING_WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(relay_msg) = outbound else { break };
                if let RelayMessage::Event { sub_id, event } = &relay_msg {
                    if let Some(ids) = seen.write().await.get_mut(sub_id) {
                        if ids.remove(&event.id) {
                            continue;
                        }
                    }
                }
                if is_advisory(&relay_msg) {
                    if !limiter.allow_advisory() {
                        consecutive_advisory_denials += 1;
                        if consecutive_advisory_denials >= MAX_ADVISORY_DENIALS {
                            break;
                        }
                        continue;
                    }
                    consecutive_advisory_denials = 0;
                }
                if !send_frame(&mut sink, &deps, &relay_msg).await {
                    break;
                }
            }
            incoming = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                match incoming {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        deps.node.metrics.messages_received.inc();
                        deps.node.metrics.message_size_in.observe(text.len() as f64);
                        if !handle_frame(
                            &text,
                            session_id,
                            remote_addr,
                            &deps,
                            &limiter,
                            &violations,
                            &subscriptions,
                            &seen,
                            &outbound_tx,
                            &mut sink,
                        ).await {
                            break 'session;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(_)) | None) => break,
                    Err(_) => break, // read deadline elapsed
                }
            }
        }
    }

    let remaining = subscriptions.write().await.drain().count();
    deps.node.metrics.active_subscriptions.sub(remaining as i64);
    let _ = tokio::time::timeout(CLOSE_WRITE_DEADLINE, sink.send(Message::Close(None))).await;
    deps.node.unregister_session(session_id).await;
}

/// Returns `false` if the session must terminate (ban threshold crossed,
/// or the advisory lane could not even accept a NOTICE).
async fn handle_frame(
    text: &str,
    session_id: Uuid,
    remote_addr: IpAddr,
    deps: &SessionDeps,
    limiter: &SessionLimiter,
    violations: &AtomicU32,
    subscriptions: &Arc<RwLock<HashMap<String, Vec<Filter>>>>,
    seen: &Arc<RwLock<HashMap<String, HashSet<String>>>>,
    outbound_tx: &mpsc::Sender<RelayMessage>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = outbound_tx.try_send(RelayMessage::notice(format!("invalid frame: {e}")));
            return true;
        }
    };

    let command = command_label(&msg);
    let started = Instant::now();
    let result = dispatch_command(
        msg,
        session_id,
        remote_addr,
        deps,
        limiter,
        violations,
        subscriptions,
        seen,
        outbound_tx,
        sink,
    )
    .await;
    deps.node
        .metrics
        .command_processing_duration
        .with_label_values(&[command])
        .observe(started.elapsed().as_secs_f64());
    result
}

fn command_label(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Event(_) => "EVENT",
        ClientMessage::Req { .. } => "REQ",
        ClientMessage::Count { .. } => "COUNT",
        ClientMessage::Close { .. } => "CLOSE",
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_command(
    msg: ClientMessage,
    session_id: Uuid,
    remote_addr: IpAddr,
    deps: &SessionDeps,
    limiter: &SessionLimiter,
    violations: &AtomicU32,
    subscriptions: &Arc<RwLock<HashMap<String, Vec<Filter>>>>,
    seen: &Arc<RwLock<HashMap<String, HashSet<String>>>>,
    outbound_tx: &mpsc::Sender<RelayMessage>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match msg {
        ClientMessage::Event(event) => {
            deps.node.metrics.commands_received.with_label_values(&["EVENT"]).inc();
            if !limiter.allow_event() {
                let count = violations.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= deps.relay_config.throttling.ban_threshold {
                    deps.node
                        .bans
                        .ban(remote_addr, Duration::from_secs(deps.relay_config.throttling.ban_duration_secs))
                        .await;
                    let _ = outbound_tx
                        .try_send(RelayMessage::notice("You have been temporarily banned."));
                    return false;
                }
                let _ = outbound_tx.try_send(RelayMessage::notice("Rate limit exceeded"));
                return true;
            }
            handle_event(*event, deps, outbound_tx).await;
        }
        ClientMessage::Req { sub_id, filters } => {
            deps.node.metrics.commands_received.with_label_values(&["REQ"]).inc();
            handle_req(sub_id, filters, session_id, deps, subscriptions, seen, sink).await;
        }
        ClientMessage::Count { sub_id, filters } => {
            deps.node.metrics.commands_received.with_label_values(&["COUNT"]).inc();
            let mut total = 0u64;
            for filter in &filters {
                deps.node.metrics.db_operations.with_label_values(&["count"]).inc();
                match deps.store.get_event_count(filter).await {
                    Ok(n) => total += n.max(0) as u64,
                    Err(e) => {
                        deps.node.metrics.db_errors.with_label_values(&["count"]).inc();
                        tracing::warn!(error = %e, "count query failed");
                    }
                }
            }
            let _ = outbound_tx.try_send(RelayMessage::count(sub_id, total));
        }
        ClientMessage::Close { sub_id } => {
            deps.node.metrics.commands_received.with_label_values(&["CLOSE"]).inc();
            if subscriptions.write().await.remove(&sub_id).is_some() {
                deps.node.metrics.active_subscriptions.dec();
            }
            seen.write().await.remove(&sub_id);
            deps.node.remove_subscription(session_id, &sub_id).await;
        }
    }
    true
}

async fn handle_event(event: Event, deps: &SessionDeps, outbound_tx: &mpsc::Sender<RelayMessage>) {
    let targets = if matches!(event.class(), EventClass::Deletion) {
        let mut map = HashMap::new();
        for target_id in event.tag_values("e") {
            let filter = Filter { ids: Some(vec![target_id.to_owned()]), ..Default::default() };
            deps.node.metrics.db_operations.with_label_values(&["deletion_target_lookup"]).inc();
            if let Ok(found) = deps.store.get_events(&filter).await {
                if let Some(found_event) = found.into_iter().next() {
                    map.insert(target_id.to_owned(), found_event.pubkey);
                }
            }
        }
        MapTargets(map)
    } else {
        MapTargets(HashMap::new())
    };

    match validator::validate(&event, &deps.validator_config, &targets) {
        Ok(()) => {
            let id = event.id.clone();
            if deps.processor.enqueue(event) {
                let _ = outbound_tx.try_send(RelayMessage::ok(id, true, ""));
            } else {
                let _ = outbound_tx.try_send(RelayMessage::ok(id, false, "server busy, try again"));
            }
        }
        Err(reason) => {
            let _ = outbound_tx.try_send(RelayMessage::ok(event.id, false, reason));
        }
    }
}

async fn handle_req(
    sub_id: String,
    filters: Vec<Filter>,
    session_id: Uuid,
    deps: &SessionDeps,
    subscriptions: &Arc<RwLock<HashMap<String, Vec<Filter>>>>,
    seen: &Arc<RwLock<HashMap<String, HashSet<String>>>>,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    // Register before the historical query so a live event committed
    // during replay cannot be lost (spec.md §4.1, §4.5).
    if subscriptions.write().await.insert(sub_id.clone(), filters.clone()).is_none() {
        deps.node.metrics.active_subscriptions.inc();
    }
    deps.node.set_subscription(session_id, &sub_id, filters.clone()).await;

    let mut merged: HashMap<String, Event> = HashMap::new();
    for filter in &filters {
        deps.node.metrics.db_operations.with_label_values(&["history_query"]).inc();
        match deps.store.get_events(filter).await {
            Ok(events) => {
                for e in events {
                    merged.insert(e.id.clone(), e);
                }
            }
            Err(e) => {
                deps.node.metrics.db_errors.with_label_values(&["history_query"]).inc();
                tracing::warn!(error = %e, "history query failed");
            }
        }
    }
    let mut results: Vec<Event> = merged.into_values().collect();
    results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    // Seed the short-lived dedup set with exactly the ids about to be
    // replayed (N = replay limit) so a commit that lands concurrently and
    // is pushed through the live path too is elided rather than
    // re-delivered (spec.md §4.5, §8.5: exactly one EVENT frame per id).
    // Sent directly to the socket (not through the outbound channel the
    // live path uses) so the dedup set above never sees — and so never
    // suppresses — the replay's own sends.
    let ids: HashSet<String> = results.iter().map(|e| e.id.clone()).collect();
    seen.write().await.insert(sub_id.clone(), ids);
    {
        let seen = seen.clone();
        let sub_id = sub_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SEEN_SET_TTL).await;
            seen.write().await.remove(&sub_id);
        });
    }

    for event in results {
        if !send_frame(sink, deps, &RelayMessage::event(sub_id.clone(), event)).await {
            return;
        }
    }
    let _ = send_frame(sink, deps, &RelayMessage::eose(sub_id)).await;
}

/// Serializes and writes one outbound frame directly to the socket under the
/// per-frame write deadline (spec.md §5). Returns `false` on serialization
/// failure, timeout, or a closed socket.
async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, deps: &SessionDeps, msg: &RelayMessage) -> bool {
    let Ok(text) = serde_json::to_string(msg) else { return false };
    deps.node.metrics.messages_sent.inc();
    deps.node.metrics.message_size_out.observe(text.len() as f64);
    matches!(
        tokio::time::timeout(FRAME_WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await,
        Ok(Ok(()))
    )
}
