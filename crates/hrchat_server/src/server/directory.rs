#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use hrchat_domain::{ChatError, UserId};
use hrchat_protocol::UserProfile;

/// Boundary to the external user directory. The chat subsystem only reads
/// profiles; user management and role assignment live elsewhere.
#[async_trait]
pub trait UserDirectory: Send + Sync {
	async fn get(&self, id: &UserId) -> Result<Option<UserProfile>, ChatError>;

	/// Case-insensitive match on id or display name; empty query returns all.
	async fn search(&self, query: &str) -> Result<Vec<UserProfile>, ChatError>;
}

/// Directory backed by a fixed profile set, seeded from server config.
#[derive(Debug, Default)]
pub struct StaticDirectory {
	users: HashMap<UserId, UserProfile>,
}

impl StaticDirectory {
	pub fn new(profiles: Vec<UserProfile>) -> Self {
		let users = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
		Self { users }
	}

	pub fn len(&self) -> usize {
		self.users.len()
	}

	pub fn is_empty(&self) -> bool {
		self.users.is_empty()
	}
}

#[async_trait]
impl UserDirectory for StaticDirectory {
	async fn get(&self, id: &UserId) -> Result<Option<UserProfile>, ChatError> {
		Ok(self.users.get(id).cloned())
	}

	async fn search(&self, query: &str) -> Result<Vec<UserProfile>, ChatError> {
		let needle = query.trim().to_lowercase();
		let mut hits: Vec<UserProfile> = self
			.users
			.values()
			.filter(|p| {
				needle.is_empty()
					|| p.display_name.to_lowercase().contains(&needle)
					|| p.id.as_str().to_lowercase().contains(&needle)
			})
			.cloned()
			.collect();
		hits.sort_by(|a, b| a.display_name.cmp(&b.display_name));
		Ok(hits)
	}
}
