#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::{MessageId, ParticipantPair, RequestId, SessionId, UserId};

/// Maximum characters in a chat message body.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Maximum characters in a connection request (and response) message.
pub const MAX_REQUEST_MESSAGE_CHARS: usize = 500;

/// Characters kept in a session's last-message preview.
pub const MESSAGE_PREVIEW_CHARS: usize = 80;

/// Lifecycle of a connection request. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
	Pending,
	Approved,
	Rejected,
	Cancelled,
}

impl RequestStatus {
	pub fn is_terminal(self) -> bool {
		!matches!(self, RequestStatus::Pending)
	}
}

/// Recipient action on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
	Approve,
	Reject,
}

/// Approval-workflow object gating session creation between role pairs that
/// require it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
	pub id: RequestId,
	pub requester: UserId,
	pub recipient: UserId,
	pub message: Option<String>,
	pub status: RequestStatus,
	pub created_at_ms: i64,
	pub responded_at_ms: Option<i64>,
	pub response_message: Option<String>,
}

impl ConnectionRequest {
	pub fn new(requester: UserId, recipient: UserId, message: Option<String>, now_ms: i64) -> Self {
		Self {
			id: RequestId::new_v4(),
			requester,
			recipient,
			message,
			status: RequestStatus::Pending,
			created_at_ms: now_ms,
			responded_at_ms: None,
			response_message: None,
		}
	}

	/// The unordered pair this request gates. Requester and recipient are
	/// distinct by construction at the service boundary.
	pub fn pair(&self) -> Option<ParticipantPair> {
		ParticipantPair::new(self.requester.clone(), self.recipient.clone()).ok()
	}

	/// Apply the recipient's decision. Returns `false` when the request is no
	/// longer pending.
	pub fn respond(&mut self, action: RequestAction, response_message: Option<String>, now_ms: i64) -> bool {
		if self.status.is_terminal() {
			return false;
		}
		self.status = match action {
			RequestAction::Approve => RequestStatus::Approved,
			RequestAction::Reject => RequestStatus::Rejected,
		};
		self.responded_at_ms = Some(now_ms);
		self.response_message = response_message;
		true
	}

	/// Requester-side cancellation. Returns `false` when no longer pending.
	pub fn cancel(&mut self, now_ms: i64) -> bool {
		if self.status.is_terminal() {
			return false;
		}
		self.status = RequestStatus::Cancelled;
		self.responded_at_ms = Some(now_ms);
		true
	}
}

/// Compact reference to a session's most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
	pub message_id: MessageId,
	pub sender: UserId,
	pub preview: String,
	pub sent_at_ms: i64,
}

/// Two-party conversation. Exactly one session exists per unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
	pub id: SessionId,
	pub participants: ParticipantPair,
	pub created_at_ms: i64,
	pub last_activity_ms: i64,
	pub last_message: Option<MessageSummary>,
	unread_first: u64,
	unread_second: u64,
}

impl ChatSession {
	pub fn new(participants: ParticipantPair, now_ms: i64) -> Self {
		Self {
			id: SessionId::new_v4(),
			participants,
			created_at_ms: now_ms,
			last_activity_ms: now_ms,
			last_message: None,
			unread_first: 0,
			unread_second: 0,
		}
	}

	/// Rebuild a session from persisted parts. Unread counters are keyed by
	/// the pair's canonical order.
	#[allow(clippy::too_many_arguments)]
	pub fn restore(
		id: SessionId,
		participants: ParticipantPair,
		created_at_ms: i64,
		last_activity_ms: i64,
		last_message: Option<MessageSummary>,
		unread_first: u64,
		unread_second: u64,
	) -> Self {
		Self {
			id,
			participants,
			created_at_ms,
			last_activity_ms,
			last_message,
			unread_first,
			unread_second,
		}
	}

	pub fn is_participant(&self, user: &UserId) -> bool {
		self.participants.contains(user)
	}

	/// Unread counter for `user`, `None` for non-participants.
	pub fn unread_for(&self, user: &UserId) -> Option<u64> {
		if user == self.participants.first() {
			Some(self.unread_first)
		} else if user == self.participants.second() {
			Some(self.unread_second)
		} else {
			None
		}
	}

	/// Overwrite `user`'s unread counter. No-op for non-participants.
	pub fn set_unread(&mut self, user: &UserId, count: u64) {
		if user == self.participants.first() {
			self.unread_first = count;
		} else if user == self.participants.second() {
			self.unread_second = count;
		}
	}

	/// Record a delivered message: bump activity, refresh the summary, and
	/// increment the *other* participant's unread counter.
	pub fn record_send(&mut self, summary: MessageSummary) {
		self.last_activity_ms = summary.sent_at_ms;
		if let Some(other) = self.participants.other(&summary.sender).cloned() {
			let unread = self.unread_for(&other).unwrap_or(0).saturating_add(1);
			self.set_unread(&other, unread);
		}
		self.last_message = Some(summary);
	}
}

/// File attachment reference; storage itself is an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	pub file_name: String,
	pub url: String,
}

/// Read receipt, append-only per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
	pub user: UserId,
	pub read_at_ms: i64,
}

/// A chat message. Immutable once stored except for `read_by` growth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub session_id: SessionId,
	pub sender: UserId,
	pub content: String,
	pub attachments: Vec<Attachment>,
	pub created_at_ms: i64,
	/// Per-session append sequence; storage order equals delivery order.
	pub seq: u64,
	pub read_by: Vec<ReadReceipt>,
}

impl Message {
	pub fn is_read_by(&self, user: &UserId) -> bool {
		self.read_by.iter().any(|r| &r.user == user)
	}

	/// Append a read receipt for `user`. Returns `false` when the receipt
	/// already exists or `user` is the sender.
	pub fn mark_read(&mut self, user: &UserId, read_at_ms: i64) -> bool {
		if &self.sender == user || self.is_read_by(user) {
			return false;
		}
		self.read_by.push(ReadReceipt {
			user: user.clone(),
			read_at_ms,
		});
		true
	}

	pub fn summary(&self) -> MessageSummary {
		let preview = if self.content.is_empty() {
			self.attachments
				.first()
				.map(|a| a.file_name.clone())
				.unwrap_or_default()
		} else {
			truncate_chars(&self.content, MESSAGE_PREVIEW_CHARS)
		};

		MessageSummary {
			message_id: self.id,
			sender: self.sender.clone(),
			preview,
			sent_at_ms: self.created_at_ms,
		}
	}
}

fn truncate_chars(s: &str, max: usize) -> String {
	if s.chars().count() <= max {
		s.to_string()
	} else {
		s.chars().take(max).collect()
	}
}

/// Validate a message body against the non-empty and length rules.
pub fn validate_message_content(content: &str, attachments: &[Attachment]) -> Result<(), ValidationError> {
	if content.trim().is_empty() && attachments.is_empty() {
		return Err(ValidationError::EmptyContent);
	}
	if content.chars().count() > MAX_MESSAGE_CHARS {
		return Err(ValidationError::ContentTooLong);
	}
	Ok(())
}

/// Validate an optional connection-request (or response) message.
pub fn validate_request_message(message: Option<&str>) -> Result<(), ValidationError> {
	if let Some(m) = message
		&& m.chars().count() > MAX_REQUEST_MESSAGE_CHARS
	{
		return Err(ValidationError::RequestMessageTooLong);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	fn message(session_id: SessionId, sender: &str, content: &str, seq: u64) -> Message {
		Message {
			id: MessageId::new_v4(),
			session_id,
			sender: user(sender),
			content: content.to_string(),
			attachments: Vec::new(),
			created_at_ms: 1_000 + seq as i64,
			seq,
			read_by: Vec::new(),
		}
	}

	#[test]
	fn request_lifecycle_is_terminal() {
		let mut req = ConnectionRequest::new(user("emp"), user("admin"), Some("need approval".into()), 10);
		assert_eq!(req.status, RequestStatus::Pending);

		assert!(req.respond(RequestAction::Approve, None, 20));
		assert_eq!(req.status, RequestStatus::Approved);
		assert_eq!(req.responded_at_ms, Some(20));

		assert!(!req.respond(RequestAction::Reject, None, 30));
		assert_eq!(req.status, RequestStatus::Approved);
		assert!(!req.cancel(30));
	}

	#[test]
	fn cancel_only_while_pending() {
		let mut req = ConnectionRequest::new(user("emp"), user("admin"), None, 10);
		assert!(req.cancel(15));
		assert_eq!(req.status, RequestStatus::Cancelled);
		assert!(!req.respond(RequestAction::Approve, None, 20));
	}

	#[test]
	fn record_send_bumps_other_side_only() {
		let pair = ParticipantPair::new(user("a"), user("b")).unwrap();
		let mut session = ChatSession::new(pair, 100);

		let msg = message(session.id, "a", "hi", 1);
		session.record_send(msg.summary());

		assert_eq!(session.unread_for(&user("a")), Some(0));
		assert_eq!(session.unread_for(&user("b")), Some(1));
		assert_eq!(session.last_activity_ms, msg.created_at_ms);
		assert_eq!(session.last_message.as_ref().unwrap().preview, "hi");
	}

	#[test]
	fn mark_read_is_append_only_and_skips_sender() {
		let session_id = SessionId::new_v4();
		let mut msg = message(session_id, "a", "hi", 1);

		assert!(!msg.mark_read(&user("a"), 5));
		assert!(msg.mark_read(&user("b"), 5));
		assert!(!msg.mark_read(&user("b"), 6));
		assert_eq!(msg.read_by.len(), 1);
	}

	#[test]
	fn content_validation() {
		assert_eq!(validate_message_content("  ", &[]), Err(ValidationError::EmptyContent));

		let attachment = Attachment {
			file_name: "cv.pdf".into(),
			url: "https://files.internal/cv.pdf".into(),
		};
		assert!(validate_message_content("", std::slice::from_ref(&attachment)).is_ok());

		let too_long = "x".repeat(MAX_MESSAGE_CHARS + 1);
		assert_eq!(validate_message_content(&too_long, &[]), Err(ValidationError::ContentTooLong));

		let long_request = "y".repeat(MAX_REQUEST_MESSAGE_CHARS + 1);
		assert_eq!(
			validate_request_message(Some(&long_request)),
			Err(ValidationError::RequestMessageTooLong)
		);
		assert!(validate_request_message(None).is_ok());
	}

	#[test]
	fn summary_preview_truncates() {
		let session_id = SessionId::new_v4();
		let long = "z".repeat(MESSAGE_PREVIEW_CHARS + 40);
		let msg = message(session_id, "a", &long, 1);
		assert_eq!(msg.summary().preview.chars().count(), MESSAGE_PREVIEW_CHARS);
	}
}
