#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod entity;
pub mod error;
pub mod policy;

pub use entity::{
	Attachment, ChatSession, ConnectionRequest, MAX_MESSAGE_CHARS, MAX_REQUEST_MESSAGE_CHARS, Message, MessageSummary,
	ReadReceipt, RequestAction, RequestStatus, validate_message_content, validate_request_message,
};
pub use error::{ChatError, ValidationError};
pub use policy::{PolicyDecision, decide};

/// Organisation roles as issued by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Admin,
	VicePresident,
	HrBusinessPartner,
	HrManager,
	HrExecutive,
	TeamManager,
	TeamLeader,
	Employee,
}

impl Role {
	/// Every role, in privilege order. Useful for exhaustive checks.
	pub const ALL: [Role; 8] = [
		Role::Admin,
		Role::VicePresident,
		Role::HrBusinessPartner,
		Role::HrManager,
		Role::HrExecutive,
		Role::TeamManager,
		Role::TeamLeader,
		Role::Employee,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Admin => "admin",
			Role::VicePresident => "vice_president",
			Role::HrBusinessPartner => "hr_business_partner",
			Role::HrManager => "hr_manager",
			Role::HrExecutive => "hr_executive",
			Role::TeamManager => "team_manager",
			Role::TeamLeader => "team_leader",
			Role::Employee => "employee",
		}
	}

	/// Elevated roles are exempt from the connection-approval flow.
	pub const fn is_elevated(self) -> bool {
		matches!(self, Role::Admin | Role::VicePresident)
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"admin" => Ok(Role::Admin),
			"vice_president" | "vp" => Ok(Role::VicePresident),
			"hr_business_partner" => Ok(Role::HrBusinessPartner),
			"hr_manager" => Ok(Role::HrManager),
			"hr_executive" => Ok(Role::HrExecutive),
			"team_manager" => Ok(Role::TeamManager),
			"team_leader" => Ok(Role::TeamLeader),
			"employee" => Ok(Role::Employee),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Identity-provider user id. Opaque to the chat subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

macro_rules! uuid_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub uuid::Uuid);

		impl $name {
			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4())
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				uuid::Uuid::parse_str(s)
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s:?}")))
			}
		}
	};
}

uuid_id!(
	/// Server-assigned chat session identifier.
	SessionId
);
uuid_id!(
	/// Server-assigned message identifier.
	MessageId
);
uuid_id!(
	/// Connection request identifier.
	RequestId
);

/// Errors for constructing a participant pair.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairError {
	#[error("participants must be distinct")]
	SameUser,
}

/// Unordered pair of chat participants, stored canonically.
///
/// Exactly one session (and at most one pending connection request) may exist
/// per pair, so equality and hashing must not depend on argument order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantPair {
	low: UserId,
	high: UserId,
}

impl ParticipantPair {
	/// Construct a pair from two distinct user ids, in either order.
	pub fn new(a: UserId, b: UserId) -> Result<Self, PairError> {
		if a == b {
			return Err(PairError::SameUser);
		}
		if a <= b { Ok(Self { low: a, high: b }) } else { Ok(Self { low: b, high: a }) }
	}

	pub fn first(&self) -> &UserId {
		&self.low
	}

	pub fn second(&self) -> &UserId {
		&self.high
	}

	pub fn contains(&self, user: &UserId) -> bool {
		&self.low == user || &self.high == user
	}

	/// The other participant, if `user` is one of the pair.
	pub fn other(&self, user: &UserId) -> Option<&UserId> {
		if user == &self.low {
			Some(&self.high)
		} else if user == &self.high {
			Some(&self.low)
		} else {
			None
		}
	}
}

impl fmt::Display for ParticipantPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}|{}", self.low, self.high)
	}
}

/// Topic helpers for session room subscriptions.
pub struct SessionTopic;

impl SessionTopic {
	/// Prefix for session room topics.
	pub const PREFIX: &'static str = "session:";

	/// Format a session room topic (e.g. `session:<uuid>`).
	pub fn format(session: SessionId) -> String {
		format!("{}{}", Self::PREFIX, session)
	}

	/// Parse a topic of the form `session:<uuid>`.
	pub fn parse(s: &str) -> Result<SessionId, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected session:<uuid>".into()))?;

		rest.parse::<SessionId>()
	}
}
