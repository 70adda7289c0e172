#![forbid(unsafe_code)]

//! Wire types shared by the server and the client projections: the push-event
//! families and the HTTP DTOs. One closed, tagged variant per event family;
//! both publish and subscribe sites match exhaustively.

use hrchat_domain::{
	Attachment, ConnectionRequest, MessageId, MessageSummary, ReadReceipt, RequestId, RequestStatus, Role, SessionId,
	UserId,
};
use serde::{Deserialize, Serialize};

/// Directory profile of a user, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub role: Role,
	pub display_name: String,
}

/// A message as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWire {
	pub id: MessageId,
	pub session_id: SessionId,
	pub sender: UserId,
	pub content: String,
	pub attachments: Vec<Attachment>,
	pub created_at_ms: i64,
	pub seq: u64,
	pub read_by: Vec<ReadReceipt>,
}

impl From<hrchat_domain::Message> for MessageWire {
	fn from(m: hrchat_domain::Message) -> Self {
		Self {
			id: m.id,
			session_id: m.session_id,
			sender: m.sender,
			content: m.content,
			attachments: m.attachments,
			created_at_ms: m.created_at_ms,
			seq: m.seq,
			read_by: m.read_by,
		}
	}
}

/// Push events fanned out by the realtime broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	NewMessage {
		session_id: SessionId,
		message: MessageWire,
	},
	MessagesRead {
		session_id: SessionId,
		reader: UserId,
		message_ids: Vec<MessageId>,
	},
	UserOnline {
		user_id: UserId,
	},
	UserOffline {
		user_id: UserId,
	},
	NewConnectionRequest {
		request: ConnectionRequest,
	},
	ConnectionRequestResponded {
		request: ConnectionRequest,
	},
}

impl ServerEvent {
	/// Event family tag, for logs and metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			ServerEvent::NewMessage { .. } => "new_message",
			ServerEvent::MessagesRead { .. } => "messages_read",
			ServerEvent::UserOnline { .. } => "user_online",
			ServerEvent::UserOffline { .. } => "user_offline",
			ServerEvent::NewConnectionRequest { .. } => "new_connection_request",
			ServerEvent::ConnectionRequestResponded { .. } => "connection_request_responded",
		}
	}
}

/// Envelope written to the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub server_time_unix_ms: i64,
	#[serde(flatten)]
	pub event: ServerEvent,
}

/// Session list entry: the session plus what the caller needs to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
	pub session_id: SessionId,
	pub peer: UserProfile,
	pub peer_online: bool,
	pub last_activity_ms: i64,
	pub last_message: Option<MessageSummary>,
	pub unread_count: u64,
}

/// Directory entry annotated with what the caller may do about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
	pub user: UserProfile,
	pub online: bool,
	pub can_chat: bool,
	pub needs_approval: bool,
	pub has_pending_request: bool,
}

/// One reverse-chronological page of a session's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
	pub session_id: SessionId,
	pub page: u32,
	pub limit: u32,
	pub messages: Vec<MessageWire>,
}

/// Body of `POST /chats/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageBody {
	#[serde(default)]
	pub content: String,
	#[serde(default)]
	pub attachments: Vec<Attachment>,
}

/// Body of `POST /chats/{id}/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadBody {
	pub message_ids: Vec<MessageId>,
}

/// Body of `POST /connections/{recipientId}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequestBody {
	#[serde(default)]
	pub message: Option<String>,
}

/// Body of `PATCH /connections/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespondRequestBody {
	pub action: hrchat_domain::RequestAction,
	#[serde(default)]
	pub response_message: Option<String>,
}

/// Result of `POST /chats/with/{otherUserId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
	pub session_id: SessionId,
	pub created: bool,
}

/// Wire form of a connection-request listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestView {
	pub id: RequestId,
	pub requester: UserProfile,
	pub message: Option<String>,
	pub status: RequestStatus,
	pub created_at_ms: i64,
}

/// Structured error body, mirroring `ChatError::code()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub code: String,
	pub message: String,
	/// Present on `needs_connection_request`: who to send the request to.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub recipient: Option<UserId>,
}

impl ErrorBody {
	pub fn from_error(err: &hrchat_domain::ChatError) -> Self {
		let recipient = match err {
			hrchat_domain::ChatError::NeedsConnectionRequest { recipient } => Some(recipient.clone()),
			_ => None,
		};
		Self {
			code: err.code().to_string(),
			message: err.to_string(),
			recipient,
		}
	}
}
