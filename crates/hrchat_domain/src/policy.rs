#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::Role;

/// Outcome of the connection policy check for a role pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
	/// The pair may chat without any approval step.
	Allowed,
	/// An approved connection request is required before a session exists.
	RequiresApproval,
}

impl PolicyDecision {
	pub fn is_allowed(self) -> bool {
		matches!(self, PolicyDecision::Allowed)
	}
}

/// Decide whether two roles may chat directly.
///
/// Total and symmetric over the full role set: approval is required exactly
/// when one side is elevated and the other is not. Two elevated roles talk
/// freely, and so do two non-elevated roles.
pub fn decide(a: Role, b: Role) -> PolicyDecision {
	if a.is_elevated() != b.is_elevated() {
		PolicyDecision::RequiresApproval
	} else {
		PolicyDecision::Allowed
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn elevated_pairs_are_open() {
		assert_eq!(decide(Role::Admin, Role::VicePresident), PolicyDecision::Allowed);
		assert_eq!(decide(Role::Admin, Role::Admin), PolicyDecision::Allowed);
	}

	#[test]
	fn peer_pairs_are_open() {
		assert_eq!(decide(Role::Employee, Role::Employee), PolicyDecision::Allowed);
		assert_eq!(decide(Role::TeamLeader, Role::HrManager), PolicyDecision::Allowed);
	}

	#[test]
	fn reaching_an_elevated_role_requires_approval() {
		assert_eq!(decide(Role::Employee, Role::Admin), PolicyDecision::RequiresApproval);
		assert_eq!(decide(Role::VicePresident, Role::TeamManager), PolicyDecision::RequiresApproval);
	}

	fn any_role() -> impl Strategy<Value = Role> {
		proptest::sample::select(Role::ALL.to_vec())
	}

	proptest! {
		#[test]
		fn decision_is_symmetric(a in any_role(), b in any_role()) {
			prop_assert_eq!(decide(a, b), decide(b, a));
		}

		#[test]
		fn decision_is_total_and_self_pairs_are_open(a in any_role()) {
			// A role always matches its own elevation class.
			prop_assert_eq!(decide(a, a), PolicyDecision::Allowed);
		}
	}
}
