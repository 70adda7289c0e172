#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use hrchat_domain::{ChatError, RequestAction, Role, UserId, ValidationError};
use hrchat_protocol::{ServerEvent, UserProfile};
use hrchat_store::Stores;
use tokio::time::timeout;

use crate::server::broker::{Broker, BrokerConfig, BrokerItem};
use crate::server::directory::StaticDirectory;
use crate::server::presence::PresenceTracker;
use crate::server::service::{ChatService, ChatServiceConfig, ClientConnection, Identity};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn ident(id: &str, role: Role) -> Identity {
	Identity { user: user(id), role }
}

fn profile(id: &str, role: Role, name: &str) -> UserProfile {
	UserProfile {
		id: user(id),
		role,
		display_name: name.to_string(),
	}
}

fn service() -> Arc<ChatService> {
	let directory = StaticDirectory::new(vec![
		profile("admin-1", Role::Admin, "Ada Admin"),
		profile("vp-1", Role::VicePresident, "Vic President"),
		profile("mgr-1", Role::TeamManager, "Mara Manager"),
		profile("emp-1", Role::Employee, "Eli Employee"),
		profile("emp-2", Role::Employee, "Eva Employee"),
	]);

	Arc::new(ChatService::new(
		Arc::new(directory),
		Stores::in_memory(),
		Broker::new(BrokerConfig {
			subscriber_queue_capacity: 64,
			debug_logs: false,
		}),
		Arc::new(PresenceTracker::new()),
		ChatServiceConfig::default(),
	))
}

/// Receive events until one of the wanted kind arrives, skipping the rest.
async fn next_event_of(conn: &mut ClientConnection, kind: &str) -> ServerEvent {
	loop {
		let item = timeout(Duration::from_millis(500), conn.events.recv())
			.await
			.unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
			.expect("channel open");
		if let BrokerItem::Event(env) = item
			&& env.event.kind() == kind
		{
			return env.event;
		}
	}
}

#[tokio::test]
async fn get_or_create_is_idempotent_for_allowed_pairs() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);

	let first = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();
	assert!(first.created);

	// Same pair from the other side returns the same session.
	let eva = ident("emp-2", Role::Employee);
	let second = svc.get_or_create_session(&eva, &user("emp-1")).await.unwrap();
	assert!(!second.created);
	assert_eq!(first.session_id, second.session_id);
}

#[tokio::test]
async fn concurrent_first_creation_yields_one_session() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let peer_b = user("emp-2");
	let peer_a = user("emp-1");
	let (a, b) = tokio::join!(
		svc.get_or_create_session(&eli, &peer_b),
		svc.get_or_create_session(&eva, &peer_a),
	);
	let a = a.unwrap();
	let b = b.unwrap();

	assert_eq!(a.session_id, b.session_id);
	assert_eq!(a.created as u8 + b.created as u8, 1, "exactly one call creates");
}

#[tokio::test]
async fn unknown_peer_and_self_chat_are_rejected() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);

	let err = svc.get_or_create_session(&eli, &user("nobody")).await.unwrap_err();
	assert_eq!(err, ChatError::NotFound("user"));

	let err = svc.get_or_create_session(&eli, &user("emp-1")).await.unwrap_err();
	assert_eq!(err, ChatError::Validation(ValidationError::SelfPair));
}

#[tokio::test]
async fn approval_flow_end_to_end() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	// Employee cannot open a session toward an elevated role directly.
	let err = svc.get_or_create_session(&eli, &user("admin-1")).await.unwrap_err();
	assert_eq!(err, ChatError::NeedsConnectionRequest {
		recipient: user("admin-1"),
	});

	let request = svc
		.create_connection_request(&eli, &user("admin-1"), Some("need approval".into()))
		.await
		.unwrap();

	let pending = svc.list_pending_requests(&ada).await.unwrap();
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].id, request.id);
	assert_eq!(pending[0].message.as_deref(), Some("need approval"));
	assert_eq!(pending[0].requester.display_name, "Eli Employee");

	svc.respond_connection_request(&ada, request.id, RequestAction::Approve, None)
		.await
		.unwrap();

	// The session was created lazily on approval and is now gettable.
	let created = svc.get_or_create_session(&eli, &user("admin-1")).await.unwrap();
	assert!(!created.created);

	svc.send_message(&eli, created.session_id, "hello".into(), Vec::new())
		.await
		.unwrap();

	let admin_sessions = svc.list_sessions_for_user(&ada).await.unwrap();
	assert_eq!(admin_sessions.len(), 1);
	assert_eq!(admin_sessions[0].unread_count, 1);
	assert_eq!(admin_sessions[0].peer.display_name, "Eli Employee");
}

#[tokio::test]
async fn rejection_keeps_the_pair_gated_but_allows_a_fresh_request() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	let request = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();
	svc.respond_connection_request(&ada, request.id, RequestAction::Reject, Some("not now".into()))
		.await
		.unwrap();

	let err = svc.get_or_create_session(&eli, &user("admin-1")).await.unwrap_err();
	assert!(matches!(err, ChatError::NeedsConnectionRequest { .. }));

	// Rejection does not permanently block re-requesting.
	svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();
}

#[tokio::test]
async fn duplicate_and_pointless_requests_conflict() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();
	let err = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	// Policy already allows employee/employee pairs.
	let err = svc.create_connection_request(&eli, &user("emp-2"), None).await.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	// Elevated pairs are open too.
	let vic = ident("vp-1", Role::VicePresident);
	let err = svc.create_connection_request(&vic, &user("admin-1"), None).await.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	// An already-approved pair cannot be re-requested either.
	let pending = svc.list_pending_requests(&ada).await.unwrap();
	svc.respond_connection_request(&ada, pending[0].id, RequestAction::Approve, None)
		.await
		.unwrap();
	let err = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));
}

#[tokio::test]
async fn respond_is_recipient_only_and_single_shot() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	let request = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();

	let err = svc
		.respond_connection_request(&eli, request.id, RequestAction::Approve, None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Forbidden);

	svc.respond_connection_request(&ada, request.id, RequestAction::Approve, None)
		.await
		.unwrap();
	let err = svc
		.respond_connection_request(&ada, request.id, RequestAction::Reject, None)
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::InvalidState);
}

#[tokio::test]
async fn pending_listing_is_elevated_only() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);

	let err = svc.list_pending_requests(&eli).await.unwrap_err();
	assert_eq!(err, ChatError::Forbidden);
}

#[tokio::test]
async fn send_message_validates_participant_and_content() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);
	let mara = ident("mgr-1", Role::TeamManager);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();

	let err = svc
		.send_message(&mara, created.session_id, "hi".into(), Vec::new())
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Forbidden);

	let err = svc
		.send_message(&eva, created.session_id, "   ".into(), Vec::new())
		.await
		.unwrap_err();
	assert_eq!(err, ChatError::Validation(ValidationError::EmptyContent));
}

#[tokio::test]
async fn offline_recipient_discovers_unread_on_fetch() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();
	for i in 1..=3 {
		svc.send_message(&eli, created.session_id, format!("m{i}"), Vec::new())
			.await
			.unwrap();
	}

	// No connection was ever open; the summary alone carries the count.
	let sessions = svc.list_sessions_for_user(&eva).await.unwrap();
	assert_eq!(sessions.len(), 1);
	assert_eq!(sessions[0].unread_count, 3);
	assert_eq!(sessions[0].last_message.as_ref().unwrap().preview, "m3");
}

#[tokio::test]
async fn mark_read_resets_to_still_unread_count() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();
	let mut ids = Vec::new();
	for i in 1..=3 {
		let m = svc
			.send_message(&eli, created.session_id, format!("m{i}"), Vec::new())
			.await
			.unwrap();
		ids.push(m.id);
	}

	let marked = svc.mark_read(&eva, created.session_id, &ids[..2]).await.unwrap();
	assert_eq!(marked.len(), 2);

	let sessions = svc.list_sessions_for_user(&eva).await.unwrap();
	assert_eq!(sessions[0].unread_count, 1);

	// Marking the same ids again is a no-op.
	let marked = svc.mark_read(&eva, created.session_id, &ids[..2]).await.unwrap();
	assert!(marked.is_empty());

	let marked = svc.mark_read(&eva, created.session_id, &ids[2..]).await.unwrap();
	assert_eq!(marked.len(), 1);
	let sessions = svc.list_sessions_for_user(&eva).await.unwrap();
	assert_eq!(sessions[0].unread_count, 0);
}

#[tokio::test]
async fn room_events_arrive_in_persisted_order() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();

	let mut conn = svc.open_connection(&eva).await;
	svc.join_room(&eva, conn.id, created.session_id).await.unwrap();

	for i in 1..=3 {
		svc.send_message(&eli, created.session_id, format!("m{i}"), Vec::new())
			.await
			.unwrap();
	}

	let mut delivered = Vec::new();
	for _ in 0..3 {
		if let ServerEvent::NewMessage { message, .. } = next_event_of(&mut conn, "new_message").await {
			delivered.push(message.seq);
		}
	}
	assert_eq!(delivered, [1, 2, 3]);

	// listMessages is reverse-chronological: the same order, reversed.
	let messages = svc.list_messages(&eva, created.session_id, 0, 10).await.unwrap();
	let listed: Vec<u64> = messages.iter().map(|m| m.seq).collect();
	assert_eq!(listed, [3, 2, 1]);
}

#[tokio::test]
async fn open_session_read_receipts_reach_the_room() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();

	let mut sender_conn = svc.open_connection(&eli).await;
	svc.join_room(&eli, sender_conn.id, created.session_id).await.unwrap();

	let m = svc
		.send_message(&eli, created.session_id, "seen?".into(), Vec::new())
		.await
		.unwrap();
	svc.mark_read(&eva, created.session_id, &[m.id]).await.unwrap();

	let event = next_event_of(&mut sender_conn, "messages_read").await;
	match event {
		ServerEvent::MessagesRead {
			reader, message_ids, ..
		} => {
			assert_eq!(reader, user("emp-2"));
			assert_eq!(message_ids, vec![m.id]);
		}
		other => panic!("expected MessagesRead, got {other:?}"),
	}
}

#[tokio::test]
async fn presence_transitions_broadcast_once_per_user() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let eva = ident("emp-2", Role::Employee);

	let mut observer = svc.open_connection(&eva).await;
	// The observer's own connection echoes its user_online; drain it first.
	let event = next_event_of(&mut observer, "user_online").await;
	assert!(matches!(event, ServerEvent::UserOnline { user_id } if user_id == user("emp-2")));

	let conn_a = svc.open_connection(&eli).await;
	let event = next_event_of(&mut observer, "user_online").await;
	assert!(matches!(event, ServerEvent::UserOnline { user_id } if user_id == user("emp-1")));

	// A second tab produces no second online event.
	let conn_b = svc.open_connection(&eli).await;
	svc.close_connection(conn_b.id).await;

	// Only the last connection produces the offline event.
	svc.close_connection(conn_a.id).await;
	let event = next_event_of(&mut observer, "user_offline").await;
	assert!(matches!(event, ServerEvent::UserOffline { user_id } if user_id == user("emp-1")));
}

#[tokio::test]
async fn join_room_is_participant_only() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let mara = ident("mgr-1", Role::TeamManager);

	let created = svc.get_or_create_session(&eli, &user("emp-2")).await.unwrap();

	let conn = svc.open_connection(&mara).await;
	let err = svc.join_room(&mara, conn.id, created.session_id).await.unwrap_err();
	assert_eq!(err, ChatError::Forbidden);

	// Nor may a caller join through someone else's connection.
	let err = svc.join_room(&eli, conn.id, created.session_id).await.unwrap_err();
	assert_eq!(err, ChatError::Forbidden);
}

#[tokio::test]
async fn available_users_annotations_follow_the_request_lifecycle() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	let entry = |entries: &Vec<hrchat_protocol::DirectoryEntry>, id: &str| {
		entries
			.iter()
			.find(|e| e.user.id == user(id))
			.cloned()
			.unwrap_or_else(|| panic!("{id} missing from directory results"))
	};

	let entries = svc.available_users(&eli, "").await.unwrap();
	assert_eq!(entries.len(), 4, "caller is excluded");

	let admin = entry(&entries, "admin-1");
	assert!(!admin.can_chat);
	assert!(admin.needs_approval);
	assert!(!admin.has_pending_request);

	let peer = entry(&entries, "emp-2");
	assert!(peer.can_chat);
	assert!(!peer.needs_approval);

	let request = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();
	let entries = svc.available_users(&eli, "").await.unwrap();
	assert!(entry(&entries, "admin-1").has_pending_request);

	svc.respond_connection_request(&ada, request.id, RequestAction::Approve, None)
		.await
		.unwrap();
	let entries = svc.available_users(&eli, "").await.unwrap();
	let admin = entry(&entries, "admin-1");
	assert!(admin.can_chat);
	assert!(!admin.needs_approval);
	assert!(!admin.has_pending_request);
}

#[tokio::test]
async fn available_users_search_filters_by_name() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);

	let entries = svc.available_users(&eli, "eva").await.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].user.id, user("emp-2"));
}

#[tokio::test]
async fn cancelled_request_stops_gating_nothing_but_frees_the_pair() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);

	let request = svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();
	svc.cancel_connection_request(&eli, request.id).await.unwrap();

	// The pair is free for a fresh request immediately.
	svc.create_connection_request(&eli, &user("admin-1"), None).await.unwrap();

	let err = svc.get_or_create_session(&eli, &user("admin-1")).await.unwrap_err();
	assert!(matches!(err, ChatError::NeedsConnectionRequest { .. }));
}

#[tokio::test]
async fn request_events_target_the_right_user() {
	let svc = service();
	let eli = ident("emp-1", Role::Employee);
	let ada = ident("admin-1", Role::Admin);

	let mut admin_conn = svc.open_connection(&ada).await;
	let mut emp_conn = svc.open_connection(&eli).await;

	let request = svc
		.create_connection_request(&eli, &user("admin-1"), Some("hi".into()))
		.await
		.unwrap();

	let event = next_event_of(&mut admin_conn, "new_connection_request").await;
	assert!(matches!(event, ServerEvent::NewConnectionRequest { request: r } if r.id == request.id));

	svc.respond_connection_request(&ada, request.id, RequestAction::Approve, None)
		.await
		.unwrap();

	let event = next_event_of(&mut emp_conn, "connection_request_responded").await;
	match event {
		ServerEvent::ConnectionRequestResponded { request: r } => {
			assert_eq!(r.id, request.id);
			assert_eq!(r.status, hrchat_domain::RequestStatus::Approved);
		}
		other => panic!("expected ConnectionRequestResponded, got {other:?}"),
	}
}
