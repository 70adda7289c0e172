#![forbid(unsafe_code)]

use thiserror::Error;

use crate::UserId;
use crate::entity::{MAX_MESSAGE_CHARS, MAX_REQUEST_MESSAGE_CHARS};

/// Validation failures for user-supplied content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("message content is empty and carries no attachment")]
	EmptyContent,
	#[error("message content exceeds {MAX_MESSAGE_CHARS} characters")]
	ContentTooLong,
	#[error("request message exceeds {MAX_REQUEST_MESSAGE_CHARS} characters")]
	RequestMessageTooLong,
	#[error("participants must be distinct users")]
	SelfPair,
}

/// Error taxonomy of the chat subsystem.
///
/// Every variant is structured enough for callers to branch on; persistence
/// failures surface as `Unavailable` and are safe to retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	/// Caller is not a participant, or not the addressed recipient.
	#[error("forbidden")]
	Forbidden,

	/// Unknown session, request, message or user.
	#[error("{0} not found")]
	NotFound(&'static str),

	/// Duplicate pending request, or a creation race lost.
	#[error("conflict: {0}")]
	Conflict(&'static str),

	/// Responding to a request that is no longer pending.
	#[error("request is not pending")]
	InvalidState,

	/// Policy requires an approved connection request for this pair.
	#[error("a connection request to {recipient} must be approved first")]
	NeedsConnectionRequest { recipient: UserId },

	#[error(transparent)]
	Validation(#[from] ValidationError),

	/// Persistence failure; the operation did not partially apply.
	#[error("storage unavailable: {0}")]
	Unavailable(String),
}

impl ChatError {
	/// Stable machine-readable code for the wire.
	pub fn code(&self) -> &'static str {
		match self {
			ChatError::Forbidden => "forbidden",
			ChatError::NotFound(_) => "not_found",
			ChatError::Conflict(_) => "conflict",
			ChatError::InvalidState => "invalid_state",
			ChatError::NeedsConnectionRequest { .. } => "needs_connection_request",
			ChatError::Validation(_) => "validation_error",
			ChatError::Unavailable(_) => "unavailable",
		}
	}
}
