#![forbid(unsafe_code)]

use std::str::FromStr;

use async_trait::async_trait;
use hrchat_domain::{
	Attachment, ChatError, ChatSession, ConnectionRequest, Message, MessageId, MessageSummary, ParticipantPair,
	ReadReceipt, RequestAction, RequestId, RequestStatus, SessionId, UserId,
};

use crate::{MessageStore, NewMessage, RequestStore, SessionStore};

/// SQLite backend for all three stores. One transaction per logical
/// operation; sequence assignment happens inside the append transaction so
/// storage order is the delivery order.
#[derive(Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		use anyhow::Context as _;

		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}
}

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> ChatError {
	move |e| ChatError::Unavailable(format!("{context}: {e}"))
}

fn decode_err(context: &'static str) -> ChatError {
	ChatError::Unavailable(format!("{context}: corrupt row"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn status_str(status: RequestStatus) -> &'static str {
	match status {
		RequestStatus::Pending => "pending",
		RequestStatus::Approved => "approved",
		RequestStatus::Rejected => "rejected",
		RequestStatus::Cancelled => "cancelled",
	}
}

fn status_from_str(s: &str) -> Option<RequestStatus> {
	match s {
		"pending" => Some(RequestStatus::Pending),
		"approved" => Some(RequestStatus::Approved),
		"rejected" => Some(RequestStatus::Rejected),
		"cancelled" => Some(RequestStatus::Cancelled),
		_ => None,
	}
}

type SessionRow = (
	String,         // id
	String,         // participant_low
	String,         // participant_high
	i64,            // created_at_ms
	i64,            // last_activity_ms
	Option<String>, // last_message_id
	Option<String>, // last_message_sender
	Option<String>, // last_message_preview
	Option<i64>,    // last_message_at_ms
	i64,            // unread_first
	i64,            // unread_second
);

const SESSION_COLUMNS: &str = "id, participant_low, participant_high, created_at_ms, last_activity_ms, \
	last_message_id, last_message_sender, last_message_preview, last_message_at_ms, unread_first, unread_second";

fn decode_session(row: SessionRow) -> Result<ChatSession, ChatError> {
	let (id, low, high, created_at_ms, last_activity_ms, msg_id, msg_sender, msg_preview, msg_at, unread_first, unread_second) =
		row;

	let id = SessionId::from_str(&id).map_err(|_| decode_err("decode session id"))?;
	let low = UserId::new(low).map_err(|_| decode_err("decode session participant"))?;
	let high = UserId::new(high).map_err(|_| decode_err("decode session participant"))?;
	let participants = ParticipantPair::new(low, high).map_err(|_| decode_err("decode session pair"))?;

	let last_message = match (msg_id, msg_sender, msg_preview, msg_at) {
		(Some(mid), Some(sender), Some(preview), Some(at)) => Some(MessageSummary {
			message_id: MessageId::from_str(&mid).map_err(|_| decode_err("decode summary id"))?,
			sender: UserId::new(sender).map_err(|_| decode_err("decode summary sender"))?,
			preview,
			sent_at_ms: at,
		}),
		_ => None,
	};

	Ok(ChatSession::restore(
		id,
		participants,
		created_at_ms,
		last_activity_ms,
		last_message,
		unread_first.max(0) as u64,
		unread_second.max(0) as u64,
	))
}

type RequestRow = (
	String,         // id
	String,         // requester
	String,         // recipient
	Option<String>, // message
	String,         // status
	i64,            // created_at_ms
	Option<i64>,    // responded_at_ms
	Option<String>, // response_message
);

const REQUEST_COLUMNS: &str =
	"id, requester, recipient, message, status, created_at_ms, responded_at_ms, response_message";

fn decode_request(row: RequestRow) -> Result<ConnectionRequest, ChatError> {
	let (id, requester, recipient, message, status, created_at_ms, responded_at_ms, response_message) = row;

	Ok(ConnectionRequest {
		id: RequestId::from_str(&id).map_err(|_| decode_err("decode request id"))?,
		requester: UserId::new(requester).map_err(|_| decode_err("decode requester"))?,
		recipient: UserId::new(recipient).map_err(|_| decode_err("decode recipient"))?,
		message,
		status: status_from_str(&status).ok_or_else(|| decode_err("decode request status"))?,
		created_at_ms,
		responded_at_ms,
		response_message,
	})
}

impl SqliteStore {
	async fn fetch_session(
		&self,
		executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
		id: SessionId,
	) -> Result<Option<ChatSession>, ChatError> {
		let row: Option<SessionRow> =
			sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(executor)
				.await
				.map_err(unavailable("select session"))?;

		row.map(decode_session).transpose()
	}

	async fn write_session(
		&self,
		executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
		session: &ChatSession,
	) -> Result<(), ChatError> {
		let summary = session.last_message.as_ref();
		sqlx::query(
			"UPDATE chat_sessions SET last_activity_ms = ?, last_message_id = ?, last_message_sender = ?, \
			last_message_preview = ?, last_message_at_ms = ?, unread_first = ?, unread_second = ? WHERE id = ?",
		)
		.bind(session.last_activity_ms)
		.bind(summary.map(|s| s.message_id.to_string()))
		.bind(summary.map(|s| s.sender.as_str().to_string()))
		.bind(summary.map(|s| s.preview.clone()))
		.bind(summary.map(|s| s.sent_at_ms))
		.bind(session.unread_for(session.participants.first()).unwrap_or(0) as i64)
		.bind(session.unread_for(session.participants.second()).unwrap_or(0) as i64)
		.bind(session.id.to_string())
		.execute(executor)
		.await
		.map_err(unavailable("update session"))?;
		Ok(())
	}
}

#[async_trait]
impl SessionStore for SqliteStore {
	async fn get(&self, id: SessionId) -> Result<Option<ChatSession>, ChatError> {
		self.fetch_session(&self.pool, id).await
	}

	async fn find_by_pair(&self, pair: &ParticipantPair) -> Result<Option<ChatSession>, ChatError> {
		let row: Option<SessionRow> = sqlx::query_as(&format!(
			"SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE participant_low = ? AND participant_high = ?"
		))
		.bind(pair.first().as_str())
		.bind(pair.second().as_str())
		.fetch_optional(&self.pool)
		.await
		.map_err(unavailable("select session by pair"))?;

		row.map(decode_session).transpose()
	}

	async fn get_or_create(&self, pair: &ParticipantPair, now_ms: i64) -> Result<(ChatSession, bool), ChatError> {
		if let Some(existing) = self.find_by_pair(pair).await? {
			return Ok((existing, false));
		}

		let session = ChatSession::new(pair.clone(), now_ms);
		let inserted = sqlx::query(
			"INSERT INTO chat_sessions (id, participant_low, participant_high, created_at_ms, last_activity_ms) \
			VALUES (?, ?, ?, ?, ?)",
		)
		.bind(session.id.to_string())
		.bind(pair.first().as_str())
		.bind(pair.second().as_str())
		.bind(session.created_at_ms)
		.bind(session.last_activity_ms)
		.execute(&self.pool)
		.await;

		match inserted {
			Ok(_) => Ok((session, true)),
			// Lost the creation race; the winner's row is authoritative.
			Err(e) if is_unique_violation(&e) => {
				let existing = self
					.find_by_pair(pair)
					.await?
					.ok_or_else(|| ChatError::Unavailable("session insert race left no row".into()))?;
				Ok((existing, false))
			}
			Err(e) => Err(unavailable("insert session")(e)),
		}
	}

	async fn list_for_user(&self, user: &UserId) -> Result<Vec<ChatSession>, ChatError> {
		let rows: Vec<SessionRow> = sqlx::query_as(&format!(
			"SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE participant_low = ? OR participant_high = ? \
			ORDER BY last_activity_ms DESC"
		))
		.bind(user.as_str())
		.bind(user.as_str())
		.fetch_all(&self.pool)
		.await
		.map_err(unavailable("list sessions"))?;

		rows.into_iter().map(decode_session).collect()
	}

	async fn record_send(&self, session_id: SessionId, summary: MessageSummary) -> Result<ChatSession, ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;

		let mut session = self
			.fetch_session(&mut *tx, session_id)
			.await?
			.ok_or(ChatError::NotFound("session"))?;
		session.record_send(summary);
		self.write_session(&mut *tx, &session).await?;

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(session)
	}

	async fn set_unread(&self, session_id: SessionId, user: &UserId, count: u64) -> Result<(), ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;

		let mut session = self
			.fetch_session(&mut *tx, session_id)
			.await?
			.ok_or(ChatError::NotFound("session"))?;
		session.set_unread(user, count);
		self.write_session(&mut *tx, &session).await?;

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(())
	}
}

type MessageRow = (String, String, String, i64, i64);

impl SqliteStore {
	async fn load_message_parts(&self, message_id: &str) -> Result<(Vec<Attachment>, Vec<ReadReceipt>), ChatError> {
		let attachment_rows: Vec<(String, String)> = sqlx::query_as(
			"SELECT file_name, url FROM chat_message_attachments WHERE message_id = ? ORDER BY idx",
		)
		.bind(message_id)
		.fetch_all(&self.pool)
		.await
		.map_err(unavailable("select attachments"))?;

		let receipt_rows: Vec<(String, i64)> = sqlx::query_as(
			"SELECT user_id, read_at_ms FROM chat_message_receipts WHERE message_id = ? ORDER BY read_at_ms",
		)
		.bind(message_id)
		.fetch_all(&self.pool)
		.await
		.map_err(unavailable("select receipts"))?;

		let attachments = attachment_rows
			.into_iter()
			.map(|(file_name, url)| Attachment { file_name, url })
			.collect();
		let read_by = receipt_rows
			.into_iter()
			.map(|(user, read_at_ms)| {
				Ok(ReadReceipt {
					user: UserId::new(user).map_err(|_| decode_err("decode receipt user"))?,
					read_at_ms,
				})
			})
			.collect::<Result<Vec<_>, ChatError>>()?;

		Ok((attachments, read_by))
	}
}

#[async_trait]
impl MessageStore for SqliteStore {
	async fn append(&self, new: NewMessage) -> Result<Message, ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;

		let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) + 1 FROM chat_messages WHERE session_id = ?")
			.bind(new.session_id.to_string())
			.fetch_one(&mut *tx)
			.await
			.map_err(unavailable("next message seq"))?;

		let message = Message {
			id: MessageId::new_v4(),
			session_id: new.session_id,
			sender: new.sender,
			content: new.content,
			attachments: new.attachments,
			created_at_ms: new.now_ms,
			seq: seq.max(1) as u64,
			read_by: Vec::new(),
		};

		sqlx::query(
			"INSERT INTO chat_messages (id, session_id, sender, content, created_at_ms, seq) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.to_string())
		.bind(message.session_id.to_string())
		.bind(message.sender.as_str())
		.bind(&message.content)
		.bind(message.created_at_ms)
		.bind(message.seq as i64)
		.execute(&mut *tx)
		.await
		.map_err(unavailable("insert message"))?;

		for (idx, attachment) in message.attachments.iter().enumerate() {
			sqlx::query(
				"INSERT INTO chat_message_attachments (message_id, idx, file_name, url) VALUES (?, ?, ?, ?)",
			)
			.bind(message.id.to_string())
			.bind(idx as i64)
			.bind(&attachment.file_name)
			.bind(&attachment.url)
			.execute(&mut *tx)
			.await
			.map_err(unavailable("insert attachment"))?;
		}

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(message)
	}

	async fn list_page(&self, session_id: SessionId, page: u32, limit: u32) -> Result<Vec<Message>, ChatError> {
		let rows: Vec<MessageRow> = sqlx::query_as(
			"SELECT id, sender, content, created_at_ms, seq FROM chat_messages WHERE session_id = ? \
			ORDER BY seq DESC LIMIT ? OFFSET ?",
		)
		.bind(session_id.to_string())
		.bind(limit as i64)
		.bind(page as i64 * limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(unavailable("list messages"))?;

		let mut messages = Vec::with_capacity(rows.len());
		for (id, sender, content, created_at_ms, seq) in rows {
			let (attachments, read_by) = self.load_message_parts(&id).await?;
			messages.push(Message {
				id: MessageId::from_str(&id).map_err(|_| decode_err("decode message id"))?,
				session_id,
				sender: UserId::new(sender).map_err(|_| decode_err("decode message sender"))?,
				content,
				attachments,
				created_at_ms,
				seq: seq.max(0) as u64,
				read_by,
			});
		}
		Ok(messages)
	}

	async fn mark_read(
		&self,
		session_id: SessionId,
		user: &UserId,
		message_ids: &[MessageId],
		now_ms: i64,
	) -> Result<Vec<MessageId>, ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;
		let mut marked = Vec::new();

		for id in message_ids {
			let row: Option<(String,)> =
				sqlx::query_as("SELECT sender FROM chat_messages WHERE id = ? AND session_id = ?")
					.bind(id.to_string())
					.bind(session_id.to_string())
					.fetch_optional(&mut *tx)
					.await
					.map_err(unavailable("select message"))?;

			let Some((sender,)) = row else { continue };
			if sender == user.as_str() {
				continue;
			}

			let result = sqlx::query(
				"INSERT OR IGNORE INTO chat_message_receipts (message_id, user_id, read_at_ms) VALUES (?, ?, ?)",
			)
			.bind(id.to_string())
			.bind(user.as_str())
			.bind(now_ms)
			.execute(&mut *tx)
			.await
			.map_err(unavailable("insert receipt"))?;

			if result.rows_affected() == 1 {
				marked.push(*id);
			}
		}

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(marked)
	}

	async fn count_unread(&self, session_id: SessionId, user: &UserId) -> Result<u64, ChatError> {
		let (count,): (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM chat_messages m WHERE m.session_id = ? AND m.sender != ? AND NOT EXISTS \
			(SELECT 1 FROM chat_message_receipts r WHERE r.message_id = m.id AND r.user_id = ?)",
		)
		.bind(session_id.to_string())
		.bind(user.as_str())
		.bind(user.as_str())
		.fetch_one(&self.pool)
		.await
		.map_err(unavailable("count unread"))?;

		Ok(count.max(0) as u64)
	}
}

#[async_trait]
impl RequestStore for SqliteStore {
	async fn create(&self, request: ConnectionRequest) -> Result<ConnectionRequest, ChatError> {
		let Some(pair) = request.pair() else {
			return Err(ChatError::Conflict("request pair is degenerate"));
		};

		let inserted = sqlx::query(
			"INSERT INTO connection_requests (id, requester, recipient, participant_low, participant_high, \
			message, status, created_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(request.id.to_string())
		.bind(request.requester.as_str())
		.bind(request.recipient.as_str())
		.bind(pair.first().as_str())
		.bind(pair.second().as_str())
		.bind(request.message.as_deref())
		.bind(status_str(request.status))
		.bind(request.created_at_ms)
		.execute(&self.pool)
		.await;

		match inserted {
			Ok(_) => Ok(request),
			Err(e) if is_unique_violation(&e) => {
				Err(ChatError::Conflict("a pending request already exists for this pair"))
			}
			Err(e) => Err(unavailable("insert request")(e)),
		}
	}

	async fn get(&self, id: RequestId) -> Result<Option<ConnectionRequest>, ChatError> {
		let row: Option<RequestRow> =
			sqlx::query_as(&format!("SELECT {REQUEST_COLUMNS} FROM connection_requests WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&self.pool)
				.await
				.map_err(unavailable("select request"))?;

		row.map(decode_request).transpose()
	}

	async fn respond(
		&self,
		id: RequestId,
		responder: &UserId,
		action: RequestAction,
		response_message: Option<String>,
		now_ms: i64,
	) -> Result<ConnectionRequest, ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;

		let row: Option<RequestRow> =
			sqlx::query_as(&format!("SELECT {REQUEST_COLUMNS} FROM connection_requests WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&mut *tx)
				.await
				.map_err(unavailable("select request"))?;
		let mut request = row.map(decode_request).transpose()?.ok_or(ChatError::NotFound("request"))?;

		if &request.recipient != responder {
			return Err(ChatError::Forbidden);
		}
		if !request.respond(action, response_message, now_ms) {
			return Err(ChatError::InvalidState);
		}

		sqlx::query("UPDATE connection_requests SET status = ?, responded_at_ms = ?, response_message = ? WHERE id = ?")
			.bind(status_str(request.status))
			.bind(request.responded_at_ms)
			.bind(request.response_message.as_deref())
			.bind(request.id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(unavailable("update request"))?;

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(request)
	}

	async fn cancel(&self, id: RequestId, requester: &UserId, now_ms: i64) -> Result<ConnectionRequest, ChatError> {
		let mut tx = self.pool.begin().await.map_err(unavailable("begin tx"))?;

		let row: Option<RequestRow> =
			sqlx::query_as(&format!("SELECT {REQUEST_COLUMNS} FROM connection_requests WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&mut *tx)
				.await
				.map_err(unavailable("select request"))?;
		let mut request = row.map(decode_request).transpose()?.ok_or(ChatError::NotFound("request"))?;

		if &request.requester != requester {
			return Err(ChatError::Forbidden);
		}
		if !request.cancel(now_ms) {
			return Err(ChatError::InvalidState);
		}

		sqlx::query("UPDATE connection_requests SET status = ?, responded_at_ms = ? WHERE id = ?")
			.bind(status_str(request.status))
			.bind(request.responded_at_ms)
			.bind(request.id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(unavailable("update request"))?;

		tx.commit().await.map_err(unavailable("commit tx"))?;
		Ok(request)
	}

	async fn find_pending(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError> {
		self.find_by_pair_and_status(pair, RequestStatus::Pending).await
	}

	async fn find_approved(&self, pair: &ParticipantPair) -> Result<Option<ConnectionRequest>, ChatError> {
		self.find_by_pair_and_status(pair, RequestStatus::Approved).await
	}

	async fn list_pending_for_recipient(&self, recipient: &UserId) -> Result<Vec<ConnectionRequest>, ChatError> {
		let rows: Vec<RequestRow> = sqlx::query_as(&format!(
			"SELECT {REQUEST_COLUMNS} FROM connection_requests WHERE recipient = ? AND status = 'pending' \
			ORDER BY created_at_ms DESC"
		))
		.bind(recipient.as_str())
		.fetch_all(&self.pool)
		.await
		.map_err(unavailable("list pending requests"))?;

		rows.into_iter().map(decode_request).collect()
	}
}

impl SqliteStore {
	async fn find_by_pair_and_status(
		&self,
		pair: &ParticipantPair,
		status: RequestStatus,
	) -> Result<Option<ConnectionRequest>, ChatError> {
		let row: Option<RequestRow> = sqlx::query_as(&format!(
			"SELECT {REQUEST_COLUMNS} FROM connection_requests WHERE participant_low = ? AND participant_high = ? \
			AND status = ? ORDER BY created_at_ms DESC LIMIT 1"
		))
		.bind(pair.first().as_str())
		.bind(pair.second().as_str())
		.bind(status_str(status))
		.fetch_optional(&self.pool)
		.await
		.map_err(unavailable("select request by pair"))?;

		row.map(decode_request).transpose()
	}
}
