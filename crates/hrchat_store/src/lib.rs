#![forbid(unsafe_code)]

//! Persistence boundary for the chat subsystem: session, message and
//! connection-request stores. Two backends: an in-memory store (the default,
//! also used by tests) and SQLite via sqlx. Every operation is a single
//! atomic write against its backend; failures surface as
//! `ChatError::Unavailable` and never leave a partially-applied row.

use std::sync::Arc;

use async_trait::async_trait;
use hrchat_domain::{
	Attachment, ChatError, ChatSession, ConnectionRequest, Message, MessageId, MessageSummary, ParticipantPair,
	RequestAction, RequestId, SessionId, UserId,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Arguments for appending a message; the store assigns id and sequence.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub session_id: SessionId,
	pub sender: UserId,
	pub content: String,
	pub attachments: Vec<Attachment>,
	pub now_ms: i64,
}

/// Two-party session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
	async fn get(&self, id: SessionId) -> Result<Option<ChatSession>, ChatError>;

	async fn find_by_pair(&self, pair: &ParticipantPair) -> Result<Option<ChatSession>, ChatError>;

	/// Idempotent get-or-create. Concurrent first calls for the same pair
	/// yield exactly one session; the bool reports whether this call created it.
	async fn get_or_create(&self, pair: &ParticipantPair, now_ms: i64) -> Result<(ChatSession, bool), ChatError>;

	/// Caller's sessions ordered by `last_activity_ms` descending.
	async fn list_for_user(&self, user: &UserId) -> Result<Vec<ChatSession>, ChatError>;

	/// Apply a delivered message: activity bump, summary refresh, and the
	/// other participant's unread increment, as one write.
	async fn record_send(&self, session_id: SessionId, summary: MessageSummary) -> Result<ChatSession, ChatError>;

	/// Overwrite one participant's unread counter.
	async fn set_unread(&self, session_id: SessionId, user: &UserId, count: u64) -> Result<(), ChatError>;
}

/// Ordered per-session message persistence with read receipts.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Append a message, assigning the next per-session sequence number.
	async fn append(&self, new: NewMessage) -> Result<Message, ChatError>;

	/// Reverse-chronological page (`page` is zero-based).
	async fn list_page(&self, session_id: SessionId, page: u32, limit: u32) -> Result<Vec<Message>, ChatError>;

	/// Append a read receipt for `user` to each named message lacking one.
	/// Returns the ids that were newly marked; sender-own messages are skipped.
	async fn mark_read(
		&self,
		session_id: SessionId,
		user: &UserId,
		message_ids: &[MessageId],
		now_ms: i64,
	) -> Result<Vec<MessageId>, ChatError>;

	/// Messages in the session from the other participant without a receipt
	/// from `user`.
	async fn count_unread(&self, session_id: SessionId, user: &UserId) -> Result<u64, ChatError>;
}

/// Connection-request lifecycle persistence.
#[async_trait]
pub trait RequestStore: Send + Sync {
	/// Persist a new pending request. Fails `Conflict` while a pending
	/// request exists for the same unordered pair.
	async fn create(&self, request: ConnectionRequest) -> Result<ConnectionRequest, ChatError>;

	async fn get(&self, id: RequestId) -> Result<Option<ConnectionRequest>, ChatError>;

	/// Recipient decision. `NotFound` for unknown ids, `Forbidden` when
	/// `responder` is not the recipient, `InvalidState` once terminal.
	async fn respond(
		&self,
		id: RequestId,
		responder: &UserId,
		action: RequestAction,
		response_message: Option<String>,
		now_ms: i64,
	) -> Result<ConnectionRequest, ChatError>;

	/// Requester-side cancellation of a pending request.
	async fn cancel(&self, id: RequestId, requester: &UserId, now_ms: i64) -> Result<ConnectionRequest, ChatError>;

	async fn find_pending(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError>;

	async fn find_approved(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError>;

	/// Pending requests addressed to `recipient`, newest first.
	async fn list_pending_for_recipient(&self, recipient: &UserId) -> Result<Vec<ConnectionRequest>, ChatError>;
}

/// The three store handles the chat service composes over.
#[derive(Clone)]
pub struct Stores {
	pub sessions: Arc<dyn SessionStore>,
	pub messages: Arc<dyn MessageStore>,
	pub requests: Arc<dyn RequestStore>,
}

impl Stores {
	/// In-memory backend; state lives for the process lifetime.
	pub fn in_memory() -> Self {
		let store = Arc::new(MemoryStore::new());
		Self {
			sessions: store.clone(),
			messages: store.clone(),
			requests: store,
		}
	}

	/// Persistent backend selected from the database URL scheme.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let store = Arc::new(SqliteStore::connect(database_url).await?);
			Ok(Self {
				sessions: store.clone(),
				messages: store.clone(),
				requests: store,
			})
		} else {
			Err(anyhow::anyhow!("unsupported database_url (use sqlite:)"))
		}
	}
}
