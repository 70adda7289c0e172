#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use hrchat_domain::{
	Attachment, ChatError, ConnectionRequest, Message, MessageId, ParticipantPair, PolicyDecision, RequestAction, Role,
	SessionId, UserId, ValidationError, decide, validate_message_content, validate_request_message,
};
use hrchat_protocol::{
	DirectoryEntry, EventEnvelope, RequestView, ServerEvent, SessionCreated, SessionSummary, UserProfile,
};
use hrchat_store::{NewMessage, Stores};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::server::broker::{Broker, BrokerItem, ConnectionId};
use crate::server::directory::UserDirectory;
use crate::server::presence::PresenceTracker;
use crate::util::time::unix_ms_now;

/// Verified caller identity, as issued by the identity provider. The chat
/// subsystem never validates credentials itself.
#[derive(Debug, Clone)]
pub struct Identity {
	pub user: UserId,
	pub role: Role,
}

/// Handle for one live push-channel connection.
pub struct ClientConnection {
	pub id: ConnectionId,
	pub user: UserId,
	pub events: mpsc::Receiver<BrokerItem>,
}

/// Tuning knobs for the chat service.
#[derive(Debug, Clone)]
pub struct ChatServiceConfig {
	pub default_page_limit: u32,
	pub max_page_limit: u32,
}

impl Default for ChatServiceConfig {
	fn default() -> Self {
		Self {
			default_page_limit: 50,
			max_page_limit: 200,
		}
	}
}

/// Orchestrator for the chat subsystem: composes the policy engine, the
/// stores, the presence tracker and the realtime broker.
pub struct ChatService {
	directory: Arc<dyn UserDirectory>,
	stores: Stores,
	broker: Broker,
	presence: Arc<PresenceTracker>,
	cfg: ChatServiceConfig,

	/// Per-session serialization point: sends and read-marks on one session
	/// never interleave, and room publish order matches store append order.
	session_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl ChatService {
	pub fn new(
		directory: Arc<dyn UserDirectory>,
		stores: Stores,
		broker: Broker,
		presence: Arc<PresenceTracker>,
		cfg: ChatServiceConfig,
	) -> Self {
		Self {
			directory,
			stores,
			broker,
			presence,
			cfg,
			session_locks: Mutex::new(HashMap::new()),
		}
	}

	/// Access the broker (embedding hosts wire their own push transport).
	#[allow(dead_code)]
	pub fn broker(&self) -> &Broker {
		&self.broker
	}

	async fn session_lock(&self, id: SessionId) -> Arc<Mutex<()>> {
		let mut locks = self.session_locks.lock().await;
		locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
	}

	fn envelope(event: ServerEvent) -> EventEnvelope {
		EventEnvelope {
			server_time_unix_ms: unix_ms_now(),
			event,
		}
	}

	async fn profile(&self, id: &UserId) -> Result<UserProfile, ChatError> {
		self.directory.get(id).await?.ok_or(ChatError::NotFound("user"))
	}

	// --- connection lifecycle -------------------------------------------------

	/// Register a push-channel connection for the caller. The first live
	/// connection of a user broadcasts `user_online` to everyone.
	pub async fn open_connection(&self, caller: &Identity) -> ClientConnection {
		let (conn_id, events) = self.broker.register(caller.user.clone()).await;
		metrics::gauge!("hrchat_server_active_connections").increment(1.0);

		if self.presence.connect(&caller.user).await {
			self.broker
				.broadcast(Self::envelope(ServerEvent::UserOnline {
					user_id: caller.user.clone(),
				}))
				.await;
		}

		info!(conn = %conn_id, user = %caller.user, "connection opened");
		ClientConnection {
			id: conn_id,
			user: caller.user.clone(),
			events,
		}
	}

	/// Tear down a connection. The last live connection of a user broadcasts
	/// `user_offline`.
	pub async fn close_connection(&self, conn_id: ConnectionId) {
		let Some(user) = self.broker.unregister(conn_id).await else {
			return;
		};
		metrics::gauge!("hrchat_server_active_connections").decrement(1.0);

		if self.presence.disconnect(&user).await {
			self.broker
				.broadcast(Self::envelope(ServerEvent::UserOffline { user_id: user.clone() }))
				.await;
		}

		info!(conn = %conn_id, user = %user, "connection closed");
	}

	/// Subscribe a connection to a session's room. Only participants may
	/// join, and only through their own connection.
	pub async fn join_room(&self, caller: &Identity, conn_id: ConnectionId, session_id: SessionId) -> Result<(), ChatError> {
		let owner = self.broker.connection_user(conn_id).await.ok_or(ChatError::NotFound("connection"))?;
		if owner != caller.user {
			return Err(ChatError::Forbidden);
		}

		let session = self.stores.sessions.get(session_id).await?.ok_or(ChatError::NotFound("session"))?;
		if !session.is_participant(&caller.user) {
			return Err(ChatError::Forbidden);
		}

		self.broker.join_room(conn_id, session_id).await;
		Ok(())
	}

	pub async fn leave_room(&self, caller: &Identity, conn_id: ConnectionId, session_id: SessionId) -> Result<(), ChatError> {
		let owner = self.broker.connection_user(conn_id).await.ok_or(ChatError::NotFound("connection"))?;
		if owner != caller.user {
			return Err(ChatError::Forbidden);
		}

		self.broker.leave_room(conn_id, session_id).await;
		Ok(())
	}

	// --- sessions -------------------------------------------------------------

	/// Idempotent get-or-create for the caller/other pair, gated by the
	/// connection policy. `RequiresApproval` pairs need an approved request.
	pub async fn get_or_create_session(&self, caller: &Identity, other: &UserId) -> Result<SessionCreated, ChatError> {
		let other_profile = self.profile(other).await?;

		let pair = ParticipantPair::new(caller.user.clone(), other.clone())
			.map_err(|_| ChatError::Validation(ValidationError::SelfPair))?;

		if let Some(existing) = self.stores.sessions.find_by_pair(&pair).await? {
			return Ok(SessionCreated {
				session_id: existing.id,
				created: false,
			});
		}

		if decide(caller.role, other_profile.role) == PolicyDecision::RequiresApproval
			&& self.stores.requests.find_approved(&pair).await?.is_none()
		{
			metrics::counter!("hrchat_server_session_needs_request_total").increment(1);
			return Err(ChatError::NeedsConnectionRequest {
				recipient: other.clone(),
			});
		}

		let (session, created) = self.stores.sessions.get_or_create(&pair, unix_ms_now()).await?;
		if created {
			metrics::counter!("hrchat_server_sessions_created_total").increment(1);
			info!(session = %session.id, pair = %pair, "session created");
		}

		Ok(SessionCreated {
			session_id: session.id,
			created,
		})
	}

	/// Caller's sessions by recency, annotated with the peer profile, the
	/// peer's presence and the caller's unread count.
	pub async fn list_sessions_for_user(&self, caller: &Identity) -> Result<Vec<SessionSummary>, ChatError> {
		let sessions = self.stores.sessions.list_for_user(&caller.user).await?;

		let mut summaries = Vec::with_capacity(sessions.len());
		for session in sessions {
			let Some(peer_id) = session.participants.other(&caller.user).cloned() else {
				continue;
			};

			let Some(peer) = self.directory.get(&peer_id).await? else {
				warn!(session = %session.id, peer = %peer_id, "peer missing from directory; skipping session");
				continue;
			};

			summaries.push(SessionSummary {
				session_id: session.id,
				peer_online: self.presence.is_online(&peer_id).await,
				peer,
				last_activity_ms: session.last_activity_ms,
				last_message: session.last_message.clone(),
				unread_count: session.unread_for(&caller.user).unwrap_or(0),
			});
		}
		Ok(summaries)
	}

	/// Directory entries annotated with what the caller may do about them.
	pub async fn available_users(&self, caller: &Identity, search: &str) -> Result<Vec<DirectoryEntry>, ChatError> {
		let profiles = self.directory.search(search).await?;

		let mut entries = Vec::with_capacity(profiles.len());
		for profile in profiles {
			if profile.id == caller.user {
				continue;
			}

			let Ok(pair) = ParticipantPair::new(caller.user.clone(), profile.id.clone()) else {
				continue;
			};

			let decision = decide(caller.role, profile.role);
			let approved = self.stores.requests.find_approved(&pair).await?.is_some();
			let pending = self.stores.requests.find_pending(&pair).await?.is_some();
			let can_chat = decision.is_allowed() || approved;

			entries.push(DirectoryEntry {
				online: self.presence.is_online(&profile.id).await,
				user: profile,
				can_chat,
				needs_approval: !can_chat,
				has_pending_request: pending,
			});
		}
		Ok(entries)
	}

	// --- messages -------------------------------------------------------------

	/// Persist and fan out a message. The per-session lock makes the store
	/// append, the unread increment and the room publish one ordered unit.
	pub async fn send_message(
		&self,
		caller: &Identity,
		session_id: SessionId,
		content: String,
		attachments: Vec<Attachment>,
	) -> Result<Message, ChatError> {
		let session = self.stores.sessions.get(session_id).await?.ok_or(ChatError::NotFound("session"))?;
		if !session.is_participant(&caller.user) {
			metrics::counter!("hrchat_server_messages_forbidden_total").increment(1);
			return Err(ChatError::Forbidden);
		}

		validate_message_content(&content, &attachments)?;

		let lock = self.session_lock(session_id).await;
		let _guard = lock.lock().await;

		let message = self
			.stores
			.messages
			.append(NewMessage {
				session_id,
				sender: caller.user.clone(),
				content,
				attachments,
				now_ms: unix_ms_now(),
			})
			.await?;
		self.stores.sessions.record_send(session_id, message.summary()).await?;

		self.broker
			.publish_to_room(session_id, Self::envelope(ServerEvent::NewMessage {
				session_id,
				message: message.clone().into(),
			}))
			.await;

		metrics::counter!("hrchat_server_messages_sent_total").increment(1);
		debug!(session = %session_id, sender = %caller.user, seq = message.seq, "message sent");
		Ok(message)
	}

	/// Append read receipts for the caller and reset the unread counter to
	/// what is still unread (new messages may have raced in).
	pub async fn mark_read(
		&self,
		caller: &Identity,
		session_id: SessionId,
		message_ids: &[MessageId],
	) -> Result<Vec<MessageId>, ChatError> {
		let session = self.stores.sessions.get(session_id).await?.ok_or(ChatError::NotFound("session"))?;
		if !session.is_participant(&caller.user) {
			return Err(ChatError::Forbidden);
		}

		let lock = self.session_lock(session_id).await;
		let _guard = lock.lock().await;

		let marked = self
			.stores
			.messages
			.mark_read(session_id, &caller.user, message_ids, unix_ms_now())
			.await?;
		let still_unread = self.stores.messages.count_unread(session_id, &caller.user).await?;
		self.stores.sessions.set_unread(session_id, &caller.user, still_unread).await?;

		if !marked.is_empty() {
			self.broker
				.publish_to_room(session_id, Self::envelope(ServerEvent::MessagesRead {
					session_id,
					reader: caller.user.clone(),
					message_ids: marked.clone(),
				}))
				.await;
			metrics::counter!("hrchat_server_messages_read_total").increment(marked.len() as u64);
		}

		Ok(marked)
	}

	/// Reverse-chronological page of a session's messages, participants only.
	pub async fn list_messages(
		&self,
		caller: &Identity,
		session_id: SessionId,
		page: u32,
		limit: u32,
	) -> Result<Vec<Message>, ChatError> {
		let session = self.stores.sessions.get(session_id).await?.ok_or(ChatError::NotFound("session"))?;
		if !session.is_participant(&caller.user) {
			return Err(ChatError::Forbidden);
		}

		let limit = if limit == 0 {
			self.cfg.default_page_limit
		} else {
			limit.min(self.cfg.max_page_limit)
		};
		self.stores.messages.list_page(session_id, page, limit).await
	}

	// --- connection requests --------------------------------------------------

	/// Open the approval workflow toward `recipient`. Fails `Conflict` when
	/// the policy already allows the pair, an approved request exists, or a
	/// pending one is in flight.
	pub async fn create_connection_request(
		&self,
		caller: &Identity,
		recipient: &UserId,
		message: Option<String>,
	) -> Result<ConnectionRequest, ChatError> {
		let recipient_profile = self.profile(recipient).await?;

		let pair = ParticipantPair::new(caller.user.clone(), recipient.clone())
			.map_err(|_| ChatError::Validation(ValidationError::SelfPair))?;

		validate_request_message(message.as_deref())?;

		if decide(caller.role, recipient_profile.role).is_allowed() {
			return Err(ChatError::Conflict("policy already allows this pair"));
		}
		if self.stores.requests.find_approved(&pair).await?.is_some() {
			return Err(ChatError::Conflict("pair already has an approved request"));
		}

		let request = ConnectionRequest::new(caller.user.clone(), recipient.clone(), message, unix_ms_now());
		let request = self.stores.requests.create(request).await.inspect_err(|e| {
			if matches!(e, ChatError::Conflict(_)) {
				metrics::counter!("hrchat_server_request_conflicts_total").increment(1);
			}
		})?;

		self.broker
			.publish_to_user(recipient, Self::envelope(ServerEvent::NewConnectionRequest {
				request: request.clone(),
			}))
			.await;

		metrics::counter!("hrchat_server_requests_created_total").increment(1);
		info!(request = %request.id, requester = %caller.user, recipient = %recipient, "connection request created");
		Ok(request)
	}

	/// Recipient decision on a pending request. Approval lazily creates the
	/// pair's session; a failed creation is tolerated (the session becomes
	/// gettable on the caller's retry).
	pub async fn respond_connection_request(
		&self,
		caller: &Identity,
		request_id: hrchat_domain::RequestId,
		action: RequestAction,
		response_message: Option<String>,
	) -> Result<ConnectionRequest, ChatError> {
		validate_request_message(response_message.as_deref())?;

		let request = self
			.stores
			.requests
			.respond(request_id, &caller.user, action, response_message, unix_ms_now())
			.await?;

		if action == RequestAction::Approve
			&& let Some(pair) = request.pair()
		{
			match self.stores.sessions.get_or_create(&pair, unix_ms_now()).await {
				Ok((session, created)) => {
					if created {
						metrics::counter!("hrchat_server_sessions_created_total").increment(1);
						info!(session = %session.id, request = %request.id, "session created on approval");
					}
				}
				Err(e) => {
					warn!(request = %request.id, error = %e, "lazy session creation after approval failed");
				}
			}
		}

		self.broker
			.publish_to_user(&request.requester, Self::envelope(ServerEvent::ConnectionRequestResponded {
				request: request.clone(),
			}))
			.await;

		metrics::counter!("hrchat_server_requests_responded_total").increment(1);
		info!(request = %request.id, status = ?request.status, "connection request responded");
		Ok(request)
	}

	/// Requester-side cancellation of a pending request.
	pub async fn cancel_connection_request(
		&self,
		caller: &Identity,
		request_id: hrchat_domain::RequestId,
	) -> Result<ConnectionRequest, ChatError> {
		let request = self.stores.requests.cancel(request_id, &caller.user, unix_ms_now()).await?;
		info!(request = %request.id, requester = %caller.user, "connection request cancelled");
		Ok(request)
	}

	/// Pending requests addressed to the caller. Elevated recipients only.
	pub async fn list_pending_requests(&self, caller: &Identity) -> Result<Vec<RequestView>, ChatError> {
		if !caller.role.is_elevated() {
			return Err(ChatError::Forbidden);
		}

		let pending = self.stores.requests.list_pending_for_recipient(&caller.user).await?;

		let mut views = Vec::with_capacity(pending.len());
		for request in pending {
			let requester = match self.directory.get(&request.requester).await? {
				Some(profile) => profile,
				None => UserProfile {
					id: request.requester.clone(),
					role: Role::Employee,
					display_name: request.requester.to_string(),
				},
			};

			views.push(RequestView {
				id: request.id,
				requester,
				message: request.message,
				status: request.status,
				created_at_ms: request.created_at_ms,
			});
		}
		Ok(views)
	}
}
