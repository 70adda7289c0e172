#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use hrchat_domain::{
	ChatError, ChatSession, ConnectionRequest, Message, MessageId, MessageSummary, ParticipantPair, RequestAction,
	RequestId, RequestStatus, SessionId, UserId,
};
use tokio::sync::Mutex;

use crate::{MessageStore, NewMessage, RequestStore, SessionStore};

/// In-memory backend for all three stores. A single lock guards the whole
/// state, so each operation is atomic relative to every other.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	sessions: HashMap<SessionId, ChatSession>,
	sessions_by_pair: HashMap<ParticipantPair, SessionId>,
	messages_by_session: HashMap<SessionId, Vec<Message>>,
	requests: HashMap<RequestId, ConnectionRequest>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SessionStore for MemoryStore {
	async fn get(&self, id: SessionId) -> Result<Option<ChatSession>, ChatError> {
		let state = self.inner.lock().await;
		Ok(state.sessions.get(&id).cloned())
	}

	async fn find_by_pair(&self, pair: &ParticipantPair) -> Result<Option<ChatSession>, ChatError> {
		let state = self.inner.lock().await;
		Ok(state
			.sessions_by_pair
			.get(pair)
			.and_then(|id| state.sessions.get(id))
			.cloned())
	}

	async fn get_or_create(&self, pair: &ParticipantPair, now_ms: i64) -> Result<(ChatSession, bool), ChatError> {
		let mut state = self.inner.lock().await;

		if let Some(id) = state.sessions_by_pair.get(pair)
			&& let Some(existing) = state.sessions.get(id)
		{
			return Ok((existing.clone(), false));
		}

		let session = ChatSession::new(pair.clone(), now_ms);
		state.sessions_by_pair.insert(pair.clone(), session.id);
		state.sessions.insert(session.id, session.clone());
		Ok((session, true))
	}

	async fn list_for_user(&self, user: &UserId) -> Result<Vec<ChatSession>, ChatError> {
		let state = self.inner.lock().await;
		let mut sessions: Vec<ChatSession> = state
			.sessions
			.values()
			.filter(|s| s.is_participant(user))
			.cloned()
			.collect();
		sessions.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
		Ok(sessions)
	}

	async fn record_send(&self, session_id: SessionId, summary: MessageSummary) -> Result<ChatSession, ChatError> {
		let mut state = self.inner.lock().await;
		let session = state.sessions.get_mut(&session_id).ok_or(ChatError::NotFound("session"))?;
		session.record_send(summary);
		Ok(session.clone())
	}

	async fn set_unread(&self, session_id: SessionId, user: &UserId, count: u64) -> Result<(), ChatError> {
		let mut state = self.inner.lock().await;
		let session = state.sessions.get_mut(&session_id).ok_or(ChatError::NotFound("session"))?;
		session.set_unread(user, count);
		Ok(())
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn append(&self, new: NewMessage) -> Result<Message, ChatError> {
		let mut state = self.inner.lock().await;
		let log = state.messages_by_session.entry(new.session_id).or_default();
		let seq = log.last().map(|m| m.seq).unwrap_or(0) + 1;

		let message = Message {
			id: MessageId::new_v4(),
			session_id: new.session_id,
			sender: new.sender,
			content: new.content,
			attachments: new.attachments,
			created_at_ms: new.now_ms,
			seq,
			read_by: Vec::new(),
		};
		log.push(message.clone());
		Ok(message)
	}

	async fn list_page(&self, session_id: SessionId, page: u32, limit: u32) -> Result<Vec<Message>, ChatError> {
		let state = self.inner.lock().await;
		let Some(log) = state.messages_by_session.get(&session_id) else {
			return Ok(Vec::new());
		};

		let skip = page as usize * limit as usize;
		Ok(log.iter().rev().skip(skip).take(limit as usize).cloned().collect())
	}

	async fn mark_read(
		&self,
		session_id: SessionId,
		user: &UserId,
		message_ids: &[MessageId],
		now_ms: i64,
	) -> Result<Vec<MessageId>, ChatError> {
		let mut state = self.inner.lock().await;
		let Some(log) = state.messages_by_session.get_mut(&session_id) else {
			return Ok(Vec::new());
		};

		let mut marked = Vec::new();
		for message in log.iter_mut() {
			if message_ids.contains(&message.id) && message.mark_read(user, now_ms) {
				marked.push(message.id);
			}
		}
		Ok(marked)
	}

	async fn count_unread(&self, session_id: SessionId, user: &UserId) -> Result<u64, ChatError> {
		let state = self.inner.lock().await;
		let Some(log) = state.messages_by_session.get(&session_id) else {
			return Ok(0);
		};

		Ok(log.iter().filter(|m| &m.sender != user && !m.is_read_by(user)).count() as u64)
	}
}

#[async_trait]
impl RequestStore for MemoryStore {
	async fn create(&self, request: ConnectionRequest) -> Result<ConnectionRequest, ChatError> {
		let mut state = self.inner.lock().await;

		let pair = request.pair();
		let duplicate = state
			.requests
			.values()
			.any(|r| r.status == RequestStatus::Pending && r.pair() == pair);
		if duplicate {
			return Err(ChatError::Conflict("a pending request already exists for this pair"));
		}

		state.requests.insert(request.id, request.clone());
		Ok(request)
	}

	async fn get(&self, id: RequestId) -> Result<Option<ConnectionRequest>, ChatError> {
		let state = self.inner.lock().await;
		Ok(state.requests.get(&id).cloned())
	}

	async fn respond(
		&self,
		id: RequestId,
		responder: &UserId,
		action: RequestAction,
		response_message: Option<String>,
		now_ms: i64,
	) -> Result<ConnectionRequest, ChatError> {
		let mut state = self.inner.lock().await;
		let request = state.requests.get_mut(&id).ok_or(ChatError::NotFound("request"))?;

		if &request.recipient != responder {
			return Err(ChatError::Forbidden);
		}
		if !request.respond(action, response_message, now_ms) {
			return Err(ChatError::InvalidState);
		}
		Ok(request.clone())
	}

	async fn cancel(&self, id: RequestId, requester: &UserId, now_ms: i64) -> Result<ConnectionRequest, ChatError> {
		let mut state = self.inner.lock().await;
		let request = state.requests.get_mut(&id).ok_or(ChatError::NotFound("request"))?;

		if &request.requester != requester {
			return Err(ChatError::Forbidden);
		}
		if !request.cancel(now_ms) {
			return Err(ChatError::InvalidState);
		}
		Ok(request.clone())
	}

	async fn find_pending(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError> {
		let state = self.inner.lock().await;
		Ok(state
			.requests
			.values()
			.find(|r| r.status == RequestStatus::Pending && r.pair().as_ref() == Some(pair))
			.cloned())
	}

	async fn find_approved(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError> {
		let state = self.inner.lock().await;
		Ok(state
			.requests
			.values()
			.find(|r| r.status == RequestStatus::Approved && r.pair().as_ref() == Some(pair))
			.cloned())
	}

	async fn list_pending_for_recipient(&self, recipient: &UserId) -> Result<Vec<ConnectionRequest>, ChatError> {
		let state = self.inner.lock().await;
		let mut pending: Vec<ConnectionRequest> = state
			.requests
			.values()
			.filter(|r| r.status == RequestStatus::Pending && &r.recipient == recipient)
			.cloned()
			.collect();
		pending.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
		Ok(pending)
	}
}

#[cfg(test)]
mod tests {
	use hrchat_domain::Attachment;

	use super::*;
	use crate::Stores;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	fn pair(a: &str, b: &str) -> ParticipantPair {
		ParticipantPair::new(user(a), user(b)).unwrap()
	}

	fn new_message(session_id: SessionId, sender: &str, content: &str, now_ms: i64) -> NewMessage {
		NewMessage {
			session_id,
			sender: user(sender),
			content: content.to_string(),
			attachments: Vec::new(),
			now_ms,
		}
	}

	#[tokio::test]
	async fn get_or_create_is_idempotent_per_unordered_pair() {
		let stores = Stores::in_memory();

		let (first, created) = stores.sessions.get_or_create(&pair("a", "b"), 10).await.unwrap();
		assert!(created);

		let (second, created) = stores.sessions.get_or_create(&pair("b", "a"), 20).await.unwrap();
		assert!(!created);
		assert_eq!(first.id, second.id);
	}

	#[tokio::test]
	async fn concurrent_creation_yields_one_session() {
		let stores = Stores::in_memory();
		let p = pair("a", "b");

		let (r1, r2) = tokio::join!(
			stores.sessions.get_or_create(&p, 10),
			stores.sessions.get_or_create(&p, 10),
		);
		let (s1, c1) = r1.unwrap();
		let (s2, c2) = r2.unwrap();

		assert_eq!(s1.id, s2.id);
		assert_eq!(c1 as u8 + c2 as u8, 1, "exactly one call creates");
	}

	#[tokio::test]
	async fn append_assigns_contiguous_sequences() {
		let stores = Stores::in_memory();
		let (session, _) = stores.sessions.get_or_create(&pair("a", "b"), 0).await.unwrap();

		for i in 1..=3 {
			let m = stores
				.messages
				.append(new_message(session.id, "a", &format!("m{i}"), i))
				.await
				.unwrap();
			assert_eq!(m.seq, i as u64);
		}

		let page = stores.messages.list_page(session.id, 0, 10).await.unwrap();
		let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
		assert_eq!(contents, ["m3", "m2", "m1"], "reverse-chronological");
	}

	#[tokio::test]
	async fn paging_splits_reverse_chronologically() {
		let stores = Stores::in_memory();
		let (session, _) = stores.sessions.get_or_create(&pair("a", "b"), 0).await.unwrap();

		for i in 1..=5 {
			stores
				.messages
				.append(new_message(session.id, "a", &format!("m{i}"), i))
				.await
				.unwrap();
		}

		let first = stores.messages.list_page(session.id, 0, 2).await.unwrap();
		let second = stores.messages.list_page(session.id, 1, 2).await.unwrap();
		assert_eq!(first.iter().map(|m| m.seq).collect::<Vec<_>>(), [5, 4]);
		assert_eq!(second.iter().map(|m| m.seq).collect::<Vec<_>>(), [3, 2]);
	}

	#[tokio::test]
	async fn unread_counts_ignore_own_and_read_messages() {
		let stores = Stores::in_memory();
		let (session, _) = stores.sessions.get_or_create(&pair("a", "b"), 0).await.unwrap();

		let m1 = stores.messages.append(new_message(session.id, "a", "one", 1)).await.unwrap();
		stores.messages.append(new_message(session.id, "a", "two", 2)).await.unwrap();
		stores.messages.append(new_message(session.id, "b", "mine", 3)).await.unwrap();

		assert_eq!(stores.messages.count_unread(session.id, &user("b")).await.unwrap(), 2);

		let marked = stores
			.messages
			.mark_read(session.id, &user("b"), &[m1.id], 4)
			.await
			.unwrap();
		assert_eq!(marked, vec![m1.id]);
		assert_eq!(stores.messages.count_unread(session.id, &user("b")).await.unwrap(), 1);

		// Re-marking is a no-op; receipts are append-only.
		let marked = stores
			.messages
			.mark_read(session.id, &user("b"), &[m1.id], 5)
			.await
			.unwrap();
		assert!(marked.is_empty());
	}

	#[tokio::test]
	async fn attachment_only_messages_are_stored() {
		let stores = Stores::in_memory();
		let (session, _) = stores.sessions.get_or_create(&pair("a", "b"), 0).await.unwrap();

		let mut new = new_message(session.id, "a", "", 1);
		new.attachments.push(Attachment {
			file_name: "offer.pdf".into(),
			url: "https://files.internal/offer.pdf".into(),
		});
		let m = stores.messages.append(new).await.unwrap();
		assert_eq!(m.attachments.len(), 1);
	}

	#[tokio::test]
	async fn one_pending_request_per_pair() {
		let stores = Stores::in_memory();

		let first = ConnectionRequest::new(user("emp"), user("admin"), None, 1);
		stores.requests.create(first.clone()).await.unwrap();

		// Same pair from the other direction still conflicts.
		let duplicate = ConnectionRequest::new(user("admin"), user("emp"), None, 2);
		let err = stores.requests.create(duplicate).await.unwrap_err();
		assert!(matches!(err, ChatError::Conflict(_)));

		// Once resolved, a fresh request may be created.
		stores
			.requests
			.respond(first.id, &user("admin"), RequestAction::Reject, None, 3)
			.await
			.unwrap();
		let fresh = ConnectionRequest::new(user("emp"), user("admin"), None, 4);
		stores.requests.create(fresh).await.unwrap();
	}

	#[tokio::test]
	async fn respond_enforces_recipient_and_state() {
		let stores = Stores::in_memory();
		let request = ConnectionRequest::new(user("emp"), user("admin"), None, 1);
		stores.requests.create(request.clone()).await.unwrap();

		let err = stores
			.requests
			.respond(request.id, &user("emp"), RequestAction::Approve, None, 2)
			.await
			.unwrap_err();
		assert_eq!(err, ChatError::Forbidden);

		stores
			.requests
			.respond(request.id, &user("admin"), RequestAction::Approve, Some("ok".into()), 2)
			.await
			.unwrap();

		let err = stores
			.requests
			.respond(request.id, &user("admin"), RequestAction::Reject, None, 3)
			.await
			.unwrap_err();
		assert_eq!(err, ChatError::InvalidState);

		let approved = stores
			.requests
			.find_approved(&pair("emp", "admin"))
			.await
			.unwrap()
			.expect("approved request");
		assert_eq!(approved.response_message.as_deref(), Some("ok"));
	}

	#[tokio::test]
	async fn cancel_frees_the_pair() {
		let stores = Stores::in_memory();
		let request = ConnectionRequest::new(user("emp"), user("admin"), None, 1);
		stores.requests.create(request.clone()).await.unwrap();

		let err = stores.requests.cancel(request.id, &user("admin"), 2).await.unwrap_err();
		assert_eq!(err, ChatError::Forbidden);

		stores.requests.cancel(request.id, &user("emp"), 2).await.unwrap();
		assert!(stores.requests.find_pending(&pair("emp", "admin")).await.unwrap().is_none());

		let fresh = ConnectionRequest::new(user("emp"), user("admin"), None, 3);
		stores.requests.create(fresh).await.unwrap();
	}

	#[tokio::test]
	async fn list_for_user_orders_by_activity() {
		let stores = Stores::in_memory();
		let (s1, _) = stores.sessions.get_or_create(&pair("a", "b"), 10).await.unwrap();
		let (s2, _) = stores.sessions.get_or_create(&pair("a", "c"), 20).await.unwrap();

		let m = stores.messages.append(new_message(s1.id, "b", "ping", 30)).await.unwrap();
		stores.sessions.record_send(s1.id, m.summary()).await.unwrap();

		let sessions = stores.sessions.list_for_user(&user("a")).await.unwrap();
		assert_eq!(sessions[0].id, s1.id);
		assert_eq!(sessions[1].id, s2.id);
		assert_eq!(sessions[0].unread_for(&user("a")), Some(1));
	}
}
