#![forbid(unsafe_code)]

//! Client-local projection of the chat state, shared by the two UI surfaces
//! (the full chat view and the shortcut overlay). Both surfaces read the same
//! cache and register which session they have open; reconciliation -- unread
//! bookkeeping, message appends, presence, resync -- is written once here.
//!
//! The cache is a synchronous state machine: the host feeds it push-channel
//! envelopes and performs the actions it returns (e.g. sending a mark-read
//! call back to the server). Missed events are never replayed; a lag marker
//! or a dropped connection flips `needs_resync` and the host re-fetches the
//! session list.

use std::collections::{HashMap, HashSet};

use hrchat_domain::{ConnectionRequest, MessageId, MessageSummary, ReadReceipt, RequestStatus, SessionId, UserId};
use hrchat_protocol::{EventEnvelope, MessageWire, ServerEvent, SessionSummary, UserProfile};
use tracing::debug;

/// The two UI surfaces sharing this cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
	ChatView,
	Overlay,
}

/// Follow-up work the host must perform after applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
	/// A message landed in a session that is open on some surface; tell the
	/// server it was read.
	SendMarkRead {
		session_id: SessionId,
		message_ids: Vec<MessageId>,
	},
}

/// One session as the client renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
	pub session_id: SessionId,
	pub peer: UserProfile,
	pub peer_online: bool,
	pub last_activity_ms: i64,
	pub last_message: Option<MessageSummary>,
	pub unread_count: u64,
}

impl CachedSession {
	fn from_summary(summary: SessionSummary) -> Self {
		Self {
			session_id: summary.session_id,
			peer: summary.peer,
			peer_online: summary.peer_online,
			last_activity_ms: summary.last_activity_ms,
			last_message: summary.last_message,
			unread_count: summary.unread_count,
		}
	}
}

/// Shared client-local store keyed by session id.
#[derive(Debug)]
pub struct SessionCache {
	me: UserId,
	sessions: HashMap<SessionId, CachedSession>,
	/// Ascending message lists for sessions some surface has open.
	messages: HashMap<SessionId, Vec<MessageWire>>,
	open_by_surface: HashMap<Surface, SessionId>,
	online: HashSet<UserId>,
	/// Incoming pending requests (for elevated users' inboxes).
	incoming_requests: Vec<ConnectionRequest>,
	needs_resync: bool,
}

impl SessionCache {
	pub fn new(me: UserId) -> Self {
		Self {
			me,
			sessions: HashMap::new(),
			messages: HashMap::new(),
			open_by_surface: HashMap::new(),
			online: HashSet::new(),
			incoming_requests: Vec::new(),
			needs_resync: false,
		}
	}

	// --- surface registration -------------------------------------------------

	/// Record which session a surface has open; `None` closes it. Message
	/// lists for sessions no surface shows are dropped.
	pub fn set_open_session(&mut self, surface: Surface, session: Option<SessionId>) {
		match session {
			Some(id) => {
				self.open_by_surface.insert(surface, id);
			}
			None => {
				self.open_by_surface.remove(&surface);
			}
		}

		let open: HashSet<SessionId> = self.open_by_surface.values().copied().collect();
		self.messages.retain(|id, _| open.contains(id));
	}

	fn is_open_somewhere(&self, session: SessionId) -> bool {
		self.open_by_surface.values().any(|id| *id == session)
	}

	/// Install a fetched page for an open session (reverse-chronological
	/// input, as the server returns it).
	pub fn set_messages(&mut self, session: SessionId, mut page: Vec<MessageWire>) {
		page.reverse();
		self.messages.insert(session, page);
	}

	// --- event reconciliation -------------------------------------------------

	/// Apply one push-channel envelope and return the host's follow-ups.
	pub fn apply(&mut self, env: &EventEnvelope) -> Vec<CacheAction> {
		match &env.event {
			ServerEvent::NewMessage { session_id, message } => self.apply_new_message(*session_id, message),
			ServerEvent::MessagesRead {
				session_id,
				reader,
				message_ids,
			} => {
				self.apply_messages_read(*session_id, reader, message_ids, env.server_time_unix_ms);
				Vec::new()
			}
			ServerEvent::UserOnline { user_id } => {
				self.online.insert(user_id.clone());
				self.set_peer_online(user_id, true);
				Vec::new()
			}
			ServerEvent::UserOffline { user_id } => {
				self.online.remove(user_id);
				self.set_peer_online(user_id, false);
				Vec::new()
			}
			ServerEvent::NewConnectionRequest { request } => {
				if request.recipient == self.me && request.status == RequestStatus::Pending {
					self.incoming_requests.retain(|r| r.id != request.id);
					self.incoming_requests.push(request.clone());
				}
				Vec::new()
			}
			ServerEvent::ConnectionRequestResponded { request } => {
				self.incoming_requests.retain(|r| r.id != request.id);
				// An approval creates a session this cache has never seen.
				if request.requester == self.me && request.status == RequestStatus::Approved {
					self.needs_resync = true;
				}
				Vec::new()
			}
		}
	}

	fn apply_new_message(&mut self, session_id: SessionId, message: &MessageWire) -> Vec<CacheAction> {
		let open_somewhere = self.is_open_somewhere(session_id);
		let own = message.sender == self.me;

		let Some(session) = self.sessions.get_mut(&session_id) else {
			// A session created after the last fetch; only a resync can
			// supply its summary.
			debug!(session = %session_id, "new_message for unknown session; resync required");
			self.needs_resync = true;
			return Vec::new();
		};

		session.last_activity_ms = message.created_at_ms;
		session.last_message = Some(summary_of(message));
		if !own && !open_somewhere {
			session.unread_count = session.unread_count.saturating_add(1);
		}

		if let Some(list) = self.messages.get_mut(&session_id)
			&& list.last().map(|m| m.id) != Some(message.id)
		{
			list.push(message.clone());
		}

		if own || !open_somewhere {
			return Vec::new();
		}

		// Visible right now: no badge, confirm the read to the server.
		vec![CacheAction::SendMarkRead {
			session_id,
			message_ids: vec![message.id],
		}]
	}

	fn apply_messages_read(&mut self, session_id: SessionId, reader: &UserId, message_ids: &[MessageId], at_ms: i64) {
		if reader == &self.me {
			if let Some(session) = self.sessions.get_mut(&session_id) {
				session.unread_count = session.unread_count.saturating_sub(message_ids.len() as u64);
			}
			return;
		}

		// Peer receipts: annotate open message lists so the sender sees them.
		if let Some(list) = self.messages.get_mut(&session_id) {
			for message in list.iter_mut() {
				if message_ids.contains(&message.id) && !message.read_by.iter().any(|r| &r.user == reader) {
					message.read_by.push(ReadReceipt {
						user: reader.clone(),
						read_at_ms: at_ms,
					});
				}
			}
		}
	}

	fn set_peer_online(&mut self, user: &UserId, online: bool) {
		for session in self.sessions.values_mut() {
			if &session.peer.id == user {
				session.peer_online = online;
			}
		}
	}

	// --- resync ---------------------------------------------------------------

	/// Missed deliveries were reported on the push channel.
	pub fn note_lagged(&mut self, dropped: u64) {
		debug!(dropped, "push channel lagged; resync required");
		self.needs_resync = true;
	}

	/// The push connection dropped; events since are gone for good.
	pub fn note_disconnected(&mut self) {
		self.needs_resync = true;
	}

	pub fn needs_resync(&self) -> bool {
		self.needs_resync
	}

	/// Replace the session list from a full re-fetch.
	pub fn resync(&mut self, sessions: Vec<SessionSummary>) {
		self.sessions = sessions
			.into_iter()
			.map(|s| (s.session_id, CachedSession::from_summary(s)))
			.collect();
		self.needs_resync = false;
	}

	// --- views ----------------------------------------------------------------

	/// Sessions by recency; the full chat view renders this directly.
	pub fn sessions_by_recency(&self) -> Vec<&CachedSession> {
		let mut sessions: Vec<&CachedSession> = self.sessions.values().collect();
		sessions.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
		sessions
	}

	pub fn session(&self, id: SessionId) -> Option<&CachedSession> {
		self.sessions.get(&id)
	}

	/// Ascending message list for an open session.
	pub fn messages(&self, session: SessionId) -> &[MessageWire] {
		self.messages.get(&session).map(Vec::as_slice).unwrap_or_default()
	}

	/// Badge total for the shortcut overlay.
	pub fn total_unread(&self) -> u64 {
		self.sessions.values().map(|s| s.unread_count).sum()
	}

	pub fn is_online(&self, user: &UserId) -> bool {
		self.online.contains(user)
	}

	pub fn incoming_requests(&self) -> &[ConnectionRequest] {
		&self.incoming_requests
	}
}

fn summary_of(message: &MessageWire) -> MessageSummary {
	let preview = if message.content.is_empty() {
		message
			.attachments
			.first()
			.map(|a| a.file_name.clone())
			.unwrap_or_default()
	} else {
		message
			.content
			.chars()
			.take(hrchat_domain::entity::MESSAGE_PREVIEW_CHARS)
			.collect()
	};

	MessageSummary {
		message_id: message.id,
		sender: message.sender.clone(),
		preview,
		sent_at_ms: message.created_at_ms,
	}
}
