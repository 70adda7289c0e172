#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hrchat_domain::{ChatError, RequestId, Role, SessionId, SessionTopic, UserId};
use hrchat_protocol::{CreateRequestBody, ErrorBody, MarkReadBody, MessagePage, RespondRequestBody, SendMessageBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::server::broker::{BrokerItem, ConnectionId};
use crate::server::health::HealthState;
use crate::server::service::{ChatService, Identity};

type ApiBody = BoxBody<Bytes, Infallible>;

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct ApiState {
	pub service: Arc<ChatService>,
	pub health: HealthState,
}

/// Accept loop for the operation surface and the SSE push channel.
pub async fn run_api_server(bind: SocketAddr, state: ApiState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "api server listening");

	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				// SSE clients end by dropping the socket; not worth a warning.
				debug!(error = %err, "api connection closed with error");
			}
		});
	}
}

fn full(bytes: Bytes) -> ApiBody {
	Full::new(bytes).boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ApiBody> {
	Response::builder()
		.status(status)
		.body(full(Bytes::from_static(body.as_bytes())))
		.unwrap()
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(full(Bytes::from(body)))
		.unwrap()
}

fn code_response(status: StatusCode, code: &str, message: &str) -> Response<ApiBody> {
	json_response(status, &ErrorBody {
		code: code.to_string(),
		message: message.to_string(),
		recipient: None,
	})
}

fn error_response(err: &ChatError) -> Response<ApiBody> {
	let status = match err {
		ChatError::Forbidden => StatusCode::FORBIDDEN,
		ChatError::NotFound(_) => StatusCode::NOT_FOUND,
		ChatError::Conflict(_) | ChatError::InvalidState | ChatError::NeedsConnectionRequest { .. } => {
			StatusCode::CONFLICT
		}
		ChatError::Validation(_) => StatusCode::BAD_REQUEST,
		ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
	};
	json_response(status, &ErrorBody::from_error(err))
}

/// Identity headers are set by the authenticating gateway; the chat
/// subsystem trusts them as-is.
fn identity_from_headers(req: &Request<Incoming>) -> Option<Identity> {
	let user = req.headers().get("x-user-id")?.to_str().ok()?;
	let role = req.headers().get("x-user-role")?.to_str().ok()?;

	let user = UserId::new(user).ok()?;
	let role: Role = role.parse().ok()?;
	Some(Identity { user, role })
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
	query
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == key)
		.map(|(_, v)| v)
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, Response<ApiBody>> {
	raw.parse::<T>()
		.map_err(|_| code_response(StatusCode::BAD_REQUEST, "bad_request", &format!("invalid {what}: {raw}")))
}

async fn read_json<T: serde::de::DeserializeOwned>(
	req: Request<Incoming>,
) -> Result<Result<T, Response<ApiBody>>, hyper::Error> {
	let bytes = req.into_body().collect().await?.to_bytes();
	match serde_json::from_slice(&bytes) {
		Ok(value) => Ok(Ok(value)),
		Err(e) => Ok(Err(code_response(
			StatusCode::BAD_REQUEST,
			"bad_request",
			&format!("invalid JSON body: {e}"),
		))),
	}
}

macro_rules! try_route {
	($expr:expr) => {
		match $expr {
			Ok(v) => v,
			Err(response) => return Ok(response),
		}
	};
}

async fn handle(req: Request<Incoming>, state: ApiState) -> Result<Response<ApiBody>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let query = req.uri().query().unwrap_or("").to_string();

	if method == Method::GET {
		match path.as_str() {
			"/healthz" => return Ok(text_response(StatusCode::OK, "ok")),
			"/readyz" => {
				return Ok(if state.health.is_ready() {
					text_response(StatusCode::OK, "ready")
				} else {
					text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
				});
			}
			_ => {}
		}
	}

	let Some(caller) = identity_from_headers(&req) else {
		return Ok(code_response(
			StatusCode::UNAUTHORIZED,
			"unauthenticated",
			"missing or invalid identity headers",
		));
	};

	let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

	match (method.as_str(), segments.as_slice()) {
		("GET", ["chats"]) => match state.service.list_sessions_for_user(&caller).await {
			Ok(sessions) => Ok(json_response(StatusCode::OK, &sessions)),
			Err(e) => Ok(error_response(&e)),
		},

		("GET", ["chats", "available-users"]) => {
			let search = query_param(&query, "search").unwrap_or("");
			match state.service.available_users(&caller, search).await {
				Ok(entries) => Ok(json_response(StatusCode::OK, &entries)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("POST", ["chats", "with", other]) => {
			let other = try_route!(parse_id::<UserId>(other, "user id"));
			match state.service.get_or_create_session(&caller, &other).await {
				Ok(created) => {
					let status = if created.created { StatusCode::CREATED } else { StatusCode::OK };
					Ok(json_response(status, &created))
				}
				Err(e) => Ok(error_response(&e)),
			}
		}

		("GET", ["chats", id, "messages"]) => {
			let session_id = try_route!(parse_id::<SessionId>(id, "session id"));
			let page = query_param(&query, "page").and_then(|v| v.parse().ok()).unwrap_or(0);
			let limit = query_param(&query, "limit").and_then(|v| v.parse().ok()).unwrap_or(0);

			match state.service.list_messages(&caller, session_id, page, limit).await {
				Ok(messages) => Ok(json_response(StatusCode::OK, &MessagePage {
					session_id,
					page,
					limit: messages.len() as u32,
					messages: messages.into_iter().map(Into::into).collect(),
				})),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("POST", ["chats", id, "messages"]) => {
			let session_id = try_route!(parse_id::<SessionId>(id, "session id"));
			let body: SendMessageBody = try_route!(read_json(req).await?);

			match state
				.service
				.send_message(&caller, session_id, body.content, body.attachments)
				.await
			{
				Ok(message) => Ok(json_response(
					StatusCode::CREATED,
					&hrchat_protocol::MessageWire::from(message),
				)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("POST", ["chats", id, "read"]) => {
			let session_id = try_route!(parse_id::<SessionId>(id, "session id"));
			let body: MarkReadBody = try_route!(read_json(req).await?);

			match state.service.mark_read(&caller, session_id, &body.message_ids).await {
				Ok(marked) => Ok(json_response(StatusCode::OK, &marked)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("POST", ["connections", recipient]) => {
			let recipient = try_route!(parse_id::<UserId>(recipient, "user id"));
			let body: CreateRequestBody = try_route!(read_json(req).await?);

			match state
				.service
				.create_connection_request(&caller, &recipient, body.message)
				.await
			{
				Ok(request) => Ok(json_response(StatusCode::CREATED, &request)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("GET", ["connections"]) => {
			if query_param(&query, "status") != Some("pending") {
				return Ok(code_response(
					StatusCode::BAD_REQUEST,
					"bad_request",
					"only status=pending is supported",
				));
			}

			match state.service.list_pending_requests(&caller).await {
				Ok(views) => Ok(json_response(StatusCode::OK, &views)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("PATCH", ["connections", id]) => {
			let request_id = try_route!(parse_id::<RequestId>(id, "request id"));
			let body: RespondRequestBody = try_route!(read_json(req).await?);

			match state
				.service
				.respond_connection_request(&caller, request_id, body.action, body.response_message)
				.await
			{
				Ok(request) => Ok(json_response(StatusCode::OK, &request)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("DELETE", ["connections", id]) => {
			let request_id = try_route!(parse_id::<RequestId>(id, "request id"));
			match state.service.cancel_connection_request(&caller, request_id).await {
				Ok(request) => Ok(json_response(StatusCode::OK, &request)),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("GET", ["events"]) => Ok(open_event_stream(&state, &caller).await),

		("POST", ["events", conn, "join", session]) => {
			let conn_id = ConnectionId(try_route!(parse_id::<u64>(conn, "connection id")));
			let session_id = try_route!(parse_id::<SessionId>(session, "session id"));

			match state.service.join_room(&caller, conn_id, session_id).await {
				Ok(()) => Ok(json_response(StatusCode::OK, &serde_json::json!({ "joined": true }))),
				Err(e) => Ok(error_response(&e)),
			}
		}

		("POST", ["events", conn, "leave", session]) => {
			let conn_id = ConnectionId(try_route!(parse_id::<u64>(conn, "connection id")));
			let session_id = try_route!(parse_id::<SessionId>(session, "session id"));

			match state.service.leave_room(&caller, conn_id, session_id).await {
				Ok(()) => Ok(json_response(StatusCode::OK, &serde_json::json!({ "joined": false }))),
				Err(e) => Ok(error_response(&e)),
			}
		}

		_ => Ok(code_response(StatusCode::NOT_FOUND, "not_found", "no such route")),
	}
}

/// Register a push-channel connection and stream its events as SSE frames.
/// The first frame names the connection id so the client can drive room
/// membership; dropping the response body tears the connection down.
async fn open_event_stream(state: &ApiState, caller: &Identity) -> Response<ApiBody> {
	let conn = state.service.open_connection(caller).await;
	debug!(conn = %conn.id, user = %conn.user, "sse stream opened");

	let greeting = Bytes::from(format!(
		"event: connected\ndata: {{\"connection_id\":{}}}\n\n",
		conn.id.0
	));

	let stream = EventStream {
		rx: conn.events,
		service: Arc::clone(&state.service),
		conn_id: conn.id,
		greeting: Some(greeting),
	};

	Response::builder()
		.status(StatusCode::OK)
		.header("content-type", "text/event-stream")
		.header("cache-control", "no-cache")
		.body(StreamBody::new(stream).boxed())
		.unwrap()
}

struct EventStream {
	rx: mpsc::Receiver<BrokerItem>,
	service: Arc<ChatService>,
	conn_id: ConnectionId,
	greeting: Option<Bytes>,
}

impl Stream for EventStream {
	type Item = Result<Frame<Bytes>, Infallible>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();

		if let Some(greeting) = this.greeting.take() {
			return Poll::Ready(Some(Ok(Frame::data(greeting))));
		}

		match this.rx.poll_recv(cx) {
			Poll::Ready(Some(item)) => Poll::Ready(Some(Ok(Frame::data(encode_sse_item(&item))))),
			Poll::Ready(None) => Poll::Ready(None),
			Poll::Pending => Poll::Pending,
		}
	}
}

impl Drop for EventStream {
	fn drop(&mut self) {
		let service = Arc::clone(&self.service);
		let conn_id = self.conn_id;
		tokio::spawn(async move {
			service.close_connection(conn_id).await;
		});
	}
}

fn encode_sse_item(item: &BrokerItem) -> Bytes {
	match item {
		BrokerItem::Event(env) => {
			let json = serde_json::to_string(env).unwrap_or_else(|_| "{}".to_string());
			// Room-scoped events carry their session topic as the SSE event
			// name so a surface can listen per open session.
			match &env.event {
				hrchat_protocol::ServerEvent::NewMessage { session_id, .. }
				| hrchat_protocol::ServerEvent::MessagesRead { session_id, .. } => {
					Bytes::from(format!("event: {}\ndata: {json}\n\n", SessionTopic::format(*session_id)))
				}
				_ => Bytes::from(format!("data: {json}\n\n")),
			}
		}
		BrokerItem::Lagged { dropped } => Bytes::from(format!("event: lagged\ndata: {{\"dropped\":{dropped}}}\n\n")),
	}
}
