//! Raw hyper HTTP/1.1 front end: `GET /ping`, `POST /lock`, `POST /unlock`.
//!
//! Grounded on the hyper server pattern the teacher uses for its plaintext
//! management listener: one `TcpListener` per bind address, one task per accepted
//! connection, drained cooperatively via `agent_core::drain`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent_core::drain::DrainWatcher;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::{Deserialize, Serialize};
use sharelock_core::{ClientId, EngineHandle, Outcome};
use tokio::net::TcpListener;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ServeError;

pub type Body = Full<Bytes>;
pub type Response = ::http::Response<Body>;

const DEFAULT_WAIT: Duration = Duration::from_secs(10);
const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Deserialize)]
struct LockRequestBody {
	key: String,
	#[serde(default)]
	timeout_ms: i64,
}

#[derive(Deserialize)]
struct UnlockRequestBody {
	key: String,
}

#[derive(Serialize)]
struct PingResponseBody {
	message: &'static str,
}

/// Mirrors the gRPC front end's wire shape: `status` is the numeric `Status` code
/// (`crate::grpc::pb_status`), not a string, so both front ends agree byte-for-byte
/// on what a caller sees for the same outcome.
#[derive(Serialize)]
struct StatusResponseBody {
	status: i32,
}

fn json_response(status: StatusCode, body: impl Serialize) -> Response {
	let bytes = serde_json::to_vec(&body).expect("response bodies are always serializable");
	::http::Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(bytes)))
		.expect("builder with known-good status and header should not fail")
}

fn empty(status: StatusCode) -> Response {
	::http::Response::builder()
		.status(status)
		.body(Body::default())
		.expect("builder with known status code should not fail")
}

fn status_for(outcome: Outcome) -> StatusCode {
	match outcome {
		Outcome::Acquired | Outcome::Released => StatusCode::OK,
		Outcome::Timeout => StatusCode::REQUEST_TIMEOUT,
		Outcome::UnknownLock => StatusCode::NOT_FOUND,
		Outcome::InvalidRequest => StatusCode::BAD_REQUEST,
	}
}

fn client_id(req: &Request<Incoming>) -> ClientId {
	req
		.headers()
		.get(CLIENT_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.into()
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, ()> {
	let bytes = req.into_body().collect().await.map_err(|_| ())?.to_bytes();
	serde_json::from_slice(&bytes).map_err(|_| ())
}

async fn handle_ping() -> Response {
	json_response(StatusCode::OK, PingResponseBody { message: "pong" })
}

async fn handle_lock(engine: &EngineHandle, req: Request<Incoming>) -> Response {
	let id = client_id(&req);
	let Ok(body) = read_json::<LockRequestBody>(req).await else {
		return empty(StatusCode::BAD_REQUEST);
	};

	let timeout = if body.timeout_ms > 0 {
		Duration::from_millis(body.timeout_ms as u64)
	} else {
		DEFAULT_WAIT
	};

	let outcome = engine
		.lock(id, Bytes::from(body.key), Some(timeout), CancellationToken::new())
		.await;
	json_response(status_for(outcome), StatusResponseBody { status: crate::grpc::pb_status(outcome) as i32 })
}

async fn handle_unlock(engine: &EngineHandle, req: Request<Incoming>) -> Response {
	let id = client_id(&req);
	let Ok(body) = read_json::<UnlockRequestBody>(req).await else {
		return empty(StatusCode::BAD_REQUEST);
	};

	let outcome = engine.unlock(id, Bytes::from(body.key)).await;
	json_response(status_for(outcome), StatusResponseBody { status: crate::grpc::pb_status(outcome) as i32 })
}

async fn route(engine: Arc<EngineHandle>, req: Request<Incoming>) -> Result<Response, Infallible> {
	let response = match (req.method(), req.uri().path()) {
		(&Method::GET, "/ping") => handle_ping().await,
		(&Method::POST, "/lock") => handle_lock(&engine, req).await,
		(&Method::POST, "/unlock") => handle_unlock(&engine, req).await,
		(_, "/lock") | (_, "/unlock") => empty(StatusCode::METHOD_NOT_ALLOWED),
		_ => empty(StatusCode::NOT_FOUND),
	};
	Ok(response)
}

/// Binds and serves the HTTP front end until `drain` signals shutdown.
pub async fn serve(
	addr: SocketAddr,
	engine: EngineHandle,
	drain: DrainWatcher,
) -> Result<(), ServeError> {
	let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind { addr, source })?;
	info!(%addr, component = "http", "listener established");

	let engine = Arc::new(engine);
	let mut incoming =
		tokio_stream::wrappers::TcpListenerStream::new(listener).take_until(Box::pin(drain.clone().wait_for_drain()));

	while let Some(Ok(socket)) = incoming.next().await {
		let _ = socket.set_nodelay(true);
		let engine = engine.clone();
		let drain = drain.clone();
		tokio::spawn(async move {
			let mut builder = hyper::server::conn::http1::Builder::new();
			builder.timer(TokioTimer::new());
			let serve = builder.serve_connection(
				TokioIo::new(socket),
				hyper::service::service_fn(move |req| {
					let engine = engine.clone();
					route(engine, req)
				}),
			);
			match futures_util::future::select(Box::pin(drain.wait_for_drain()), serve).await {
				futures_util::future::Either::Left((_shutdown, mut serve)) => {
					std::pin::Pin::new(&mut serve).graceful_shutdown();
					if let Err(err) = serve.await {
						warn!(%err, "http connection error during drain");
					}
				}
				futures_util::future::Either::Right((Err(err), _)) => {
					warn!(%err, "http connection error");
				}
				futures_util::future::Either::Right((Ok(()), _)) => {}
			}
		});
	}
	info!(%addr, component = "http", "listener drained");
	Ok(())
}
