#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use hrchat_domain::UserId;
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory online-user set, reference-counted per identity.
///
/// A user with several live connections (tabs, devices) holds one entry; only
/// the first connection and the last disconnection produce a transition, so
/// presence never flaps on a single extra socket. Constructed at server start
/// and injected; state is rebuilt from live connections after a restart.
#[derive(Debug, Default)]
pub struct PresenceTracker {
	inner: Mutex<HashMap<UserId, u64>>,
}

impl PresenceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Account for a new connection. Returns `true` when the user came online.
	pub async fn connect(&self, user: &UserId) -> bool {
		let mut online = self.inner.lock().await;
		let count = online.entry(user.clone()).or_insert(0);
		*count += 1;

		let became_online = *count == 1;
		if became_online {
			metrics::gauge!("hrchat_server_online_users").increment(1.0);
			debug!(user = %user, "presence: online");
		}
		became_online
	}

	/// Account for a closed connection. Returns `true` when the user went
	/// offline (last connection gone).
	pub async fn disconnect(&self, user: &UserId) -> bool {
		let mut online = self.inner.lock().await;
		match online.get_mut(user) {
			Some(count) if *count <= 1 => {
				online.remove(user);
				metrics::gauge!("hrchat_server_online_users").decrement(1.0);
				debug!(user = %user, "presence: offline");
				true
			}
			Some(count) => {
				*count -= 1;
				false
			}
			None => false,
		}
	}

	pub async fn is_online(&self, user: &UserId) -> bool {
		let online = self.inner.lock().await;
		online.contains_key(user)
	}

	/// Snapshot of currently online user ids.
	#[allow(dead_code)]
	pub async fn online_snapshot(&self) -> HashSet<UserId> {
		let online = self.inner.lock().await;
		online.keys().cloned().collect()
	}
}
