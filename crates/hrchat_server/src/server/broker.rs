#![forbid(unsafe_code)]

use core::fmt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hrchat_domain::{SessionId, UserId};
use hrchat_protocol::EventEnvelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Broker-local connection identifier, one per live push-channel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Connection-scoped pub/sub: rooms keyed by session id, a per-user
/// connection index for targeted delivery, and a broadcast lane for presence.
/// Delivery is best-effort; a full subscriber queue drops the event and the
/// drop is reported through a `Lagged` marker on the next successful send.
#[derive(Debug, Clone)]
pub struct Broker {
	inner: Arc<Mutex<Inner>>,
	cfg: BrokerConfig,
}

/// Configuration for `Broker`.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	/// Maximum number of queued items per connection.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a connection's event stream.
#[derive(Debug, Clone)]
pub enum BrokerItem {
	Event(EventEnvelope),

	/// The connection lagged and `dropped` items were not delivered.
	Lagged { dropped: u64 },
}

#[derive(Debug, Default)]
struct Inner {
	next_conn_id: u64,
	conns: HashMap<ConnectionId, ConnEntry>,
	rooms: HashMap<SessionId, HashSet<ConnectionId>>,
	conns_by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

#[derive(Debug)]
struct ConnEntry {
	user: UserId,
	tx: mpsc::Sender<BrokerItem>,
	rooms: HashSet<SessionId>,

	/// Items dropped since the last successful delivery.
	pending_lag: u64,
}

impl Broker {
	pub fn new(cfg: BrokerConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection for `user` and hand back its event stream.
	pub async fn register(&self, user: UserId) -> (ConnectionId, mpsc::Receiver<BrokerItem>) {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.next_conn_id += 1;
		let conn_id = ConnectionId(inner.next_conn_id);

		inner.conns_by_user.entry(user.clone()).or_default().insert(conn_id);
		inner.conns.insert(conn_id, ConnEntry {
			user,
			tx,
			rooms: HashSet::new(),
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(conn = %conn_id, total = inner.conns.len(), "broker: registered connection");
		}

		(conn_id, rx)
	}

	/// Remove a connection and all of its room memberships. Returns the
	/// connection's user when it was known.
	pub async fn unregister(&self, conn_id: ConnectionId) -> Option<UserId> {
		let mut inner = self.inner.lock().await;
		let entry = inner.conns.remove(&conn_id)?;

		for room in &entry.rooms {
			if let Some(members) = inner.rooms.get_mut(room) {
				members.remove(&conn_id);
				if members.is_empty() {
					inner.rooms.remove(room);
				}
			}
		}

		if let Some(set) = inner.conns_by_user.get_mut(&entry.user) {
			set.remove(&conn_id);
			if set.is_empty() {
				inner.conns_by_user.remove(&entry.user);
			}
		}

		if self.cfg.debug_logs {
			debug!(conn = %conn_id, user = %entry.user, "broker: unregistered connection");
		}

		Some(entry.user)
	}

	/// The user behind a connection, if it is still registered.
	pub async fn connection_user(&self, conn_id: ConnectionId) -> Option<UserId> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).map(|e| e.user.clone())
	}

	/// Subscribe a connection to a session room. Returns `false` for unknown
	/// connections.
	pub async fn join_room(&self, conn_id: ConnectionId, session: SessionId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn_id) else {
			return false;
		};

		entry.rooms.insert(session);
		inner.rooms.entry(session).or_default().insert(conn_id);

		if self.cfg.debug_logs {
			debug!(conn = %conn_id, session = %session, "broker: joined room");
		}
		true
	}

	pub async fn leave_room(&self, conn_id: ConnectionId, session: SessionId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.rooms.remove(&session);
		}
		if let Some(members) = inner.rooms.get_mut(&session) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.rooms.remove(&session);
			}
		}
	}

	/// Publish to every connection subscribed to the session's room.
	pub async fn publish_to_room(&self, session: SessionId, env: EventEnvelope) {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.rooms.get(&session) else {
			return;
		};

		let targets: Vec<ConnectionId> = members.iter().copied().collect();
		self.deliver_to(&mut inner, &targets, env);
	}

	/// Publish to all live connections of one user.
	pub async fn publish_to_user(&self, user: &UserId, env: EventEnvelope) {
		let mut inner = self.inner.lock().await;
		let Some(conns) = inner.conns_by_user.get(user) else {
			return;
		};

		let targets: Vec<ConnectionId> = conns.iter().copied().collect();
		self.deliver_to(&mut inner, &targets, env);
	}

	/// Publish to every registered connection.
	pub async fn broadcast(&self, env: EventEnvelope) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnectionId> = inner.conns.keys().copied().collect();
		self.deliver_to(&mut inner, &targets, env);
	}

	fn deliver_to(&self, inner: &mut Inner, targets: &[ConnectionId], env: EventEnvelope) {
		let mut dropped_total: u64 = 0;
		let mut closed: Vec<ConnectionId> = Vec::new();

		for conn_id in targets {
			let Some(entry) = inner.conns.get_mut(conn_id) else {
				continue;
			};

			match entry.tx.try_send(BrokerItem::Event(env.clone())) {
				Ok(()) => {
					metrics::counter!("hrchat_server_events_published_total").increment(1);

					if entry.pending_lag > 0
						&& entry
							.tx
							.try_send(BrokerItem::Lagged {
								dropped: entry.pending_lag,
							})
							.is_ok()
					{
						entry.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					entry.pending_lag = entry.pending_lag.saturating_add(1);
					metrics::counter!("hrchat_server_events_dropped_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					closed.push(*conn_id);
				}
			}
		}

		for conn_id in closed {
			remove_conn_locked(inner, conn_id);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				event = env.event.kind(),
				dropped = dropped_total,
				"broker: dropped due to full subscriber queues"
			);
		}
	}

	/// Snapshot of subscriber counts per room.
	#[allow(dead_code)]
	pub async fn room_subscriber_counts(&self) -> HashMap<SessionId, usize> {
		let inner = self.inner.lock().await;
		inner.rooms.iter().map(|(k, v)| (*k, v.len())).collect()
	}
}

fn remove_conn_locked(inner: &mut Inner, conn_id: ConnectionId) {
	let Some(entry) = inner.conns.remove(&conn_id) else {
		return;
	};

	for room in &entry.rooms {
		if let Some(members) = inner.rooms.get_mut(room) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	if let Some(set) = inner.conns_by_user.get_mut(&entry.user) {
		set.remove(&conn_id);
		if set.is_empty() {
			inner.conns_by_user.remove(&entry.user);
		}
	}
}
