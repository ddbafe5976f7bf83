//! Tonic gRPC front end: `ShareLockService.{Ping,Lock,Unlock}` over an optionally
//! TLS-wrapped TCP listener.
//!
//! Grounded on the teacher's own gRPC surface (it is a tonic client throughout, never
//! a server) for the request/response shape, and on `crate::http`'s manual
//! accept-loop-plus-drain pattern for connection lifecycle, since the teacher has no
//! tonic *server* of its own to imitate directly.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use agent_core::drain::DrainWatcher;
use bytes::Bytes;
use fs_err as fs;
use futures_util::FutureExt;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sharelock_core::{ClientId, EngineHandle, Outcome};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Connected;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::config::TlsConfig;
use crate::error::ServeError;

pub(crate) mod pb {
	tonic::include_proto!("sharelock.v1");
}

use pb::share_lock_service_server::{ShareLockService, ShareLockServiceServer};
pub use pb::{LockRequest, LockResponse, PingRequest, PingResponse, UnlockRequest, UnlockResponse};

const DEFAULT_WAIT: Duration = Duration::from_secs(10);
const CLIENT_ID_METADATA: &str = "x-client-id";

/// Maps an engine outcome onto the wire `Status` code. Also used by `crate::http` so
/// both front ends agree on the numeric status in their response bodies.
pub(crate) fn pb_status(outcome: Outcome) -> pb::Status {
	match outcome {
		Outcome::Acquired => pb::Status::Acquired,
		Outcome::Released => pb::Status::Released,
		Outcome::Timeout => pb::Status::Timeout,
		Outcome::UnknownLock => pb::Status::UnknownLock,
		Outcome::InvalidRequest => pb::Status::InvalidData,
	}
}

fn client_id<T>(req: &Request<T>) -> ClientId {
	req
		.metadata()
		.get(CLIENT_ID_METADATA)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.into()
}

struct Svc {
	engine: EngineHandle,
}

#[tonic::async_trait]
impl ShareLockService for Svc {
	async fn ping(&self, _req: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
		Ok(Response::new(PingResponse { message: "pong".to_string() }))
	}

	async fn lock(&self, req: Request<LockRequest>) -> Result<Response<LockResponse>, Status> {
		let id = client_id(&req);
		let body = req.into_inner();
		let timeout = if body.timeout_ms > 0 { Duration::from_millis(body.timeout_ms as u64) } else { DEFAULT_WAIT };

		let outcome = self.engine.lock(id, Bytes::from(body.key), Some(timeout), CancellationToken::new()).await;
		Ok(Response::new(LockResponse { status: pb_status(outcome) as i32 }))
	}

	async fn unlock(&self, req: Request<UnlockRequest>) -> Result<Response<UnlockResponse>, Status> {
		let id = client_id(&req);
		let body = req.into_inner();
		let outcome = self.engine.unlock(id, Bytes::from(body.key)).await;
		Ok(Response::new(UnlockResponse { status: pb_status(outcome) as i32 }))
	}
}

/// Either side of an optionally-TLS-terminated accepted socket. Tonic's server only
/// needs `AsyncRead + AsyncWrite + Connected`; dispatching by hand here avoids pulling
/// in tonic's own `tls` feature (and the extra certificate-format plumbing it brings)
/// for what is otherwise the same `rustls`/`tokio-rustls` stack the rest of this repo
/// already depends on.
enum Conn {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Conn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_flush(cx),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

impl Connected for Conn {
	type ConnectInfo = ();

	fn connect_info(&self) -> Self::ConnectInfo {}
}

fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ServeError> {
	let cert_bytes = fs::read(&tls.cert_path).map_err(|source| ServeError::Tls { path: tls.cert_path.clone(), source })?;
	let key_bytes = fs::read(&tls.key_path).map_err(|source| ServeError::Tls { path: tls.key_path.clone(), source })?;

	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
		.collect::<Result<_, _>>()
		.map_err(|source| ServeError::Tls { path: tls.cert_path.clone(), source })?;
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
		.map_err(|source| ServeError::Tls { path: tls.key_path.clone(), source })?
		.ok_or_else(|| ServeError::NoPrivateKey(tls.key_path.clone()))?;

	// `builder_with_provider`, not the bare `builder()`: this crate enables only the
	// `ring` backend with default features off, so there is no process-wide default
	// `CryptoProvider` installed to fall back on.
	let mut server_config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
		.with_safe_default_protocol_versions()
		.map_err(|err| ServeError::Tls { path: tls.cert_path.clone(), source: std::io::Error::other(err) })?
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|err| ServeError::Tls { path: tls.cert_path.clone(), source: std::io::Error::other(err) })?;
	server_config.alpn_protocols = vec![b"h2".to_vec()];

	Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Accepts one connection, TLS-wrapping it if `acceptor` is set. Handshake and accept
/// failures are logged and retried rather than ending the listener: a single bad
/// client must never take the front end down.
async fn accept_one(listener: &TcpListener, acceptor: &Option<TlsAcceptor>) -> Conn {
	loop {
		let socket = match listener.accept().await {
			Ok((socket, _)) => socket,
			Err(err) => {
				warn!(%err, component = "grpc", "accept error");
				continue;
			}
		};
		let _ = socket.set_nodelay(true);
		match acceptor {
			None => return Conn::Plain(socket),
			Some(acceptor) => match acceptor.accept(socket).await {
				Ok(tls) => return Conn::Tls(Box::new(tls)),
				Err(err) => {
					warn!(%err, component = "grpc", "TLS handshake failed");
					continue;
				}
			},
		}
	}
}

/// Binds and serves the gRPC front end until `drain` signals shutdown.
pub async fn serve(addr: SocketAddr, engine: EngineHandle, tls: Option<TlsConfig>, drain: DrainWatcher) -> Result<(), ServeError> {
	let acceptor = tls.as_ref().map(load_tls_acceptor).transpose()?;

	let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind { addr, source })?;
	info!(%addr, component = "grpc", tls = acceptor.is_some(), "listener established");

	// Tonic stops polling this stream, but never cancels an in-flight `accept_one`,
	// once the shutdown signal below resolves; existing connections still drain
	// gracefully, matching the HTTP front end's behaviour.
	let incoming = futures_util::stream::unfold((listener, acceptor), |(listener, acceptor)| async move {
		let conn = accept_one(&listener, &acceptor).await;
		Some((Ok::<_, std::io::Error>(conn), (listener, acceptor)))
	});

	let svc = ShareLockServiceServer::new(Svc { engine });
	// Cloned, not moved: `drain` itself stays alive for the rest of this function, so
	// the drain trigger cannot complete until `serve` returns, matching the HTTP front
	// end's lifetime. The clone here only carries the "stop accepting" signal.
	Server::builder()
		.add_service(svc)
		.serve_with_incoming_shutdown(incoming, drain.clone().wait_for_drain().map(drop))
		.await?;

	info!(%addr, component = "grpc", "listener drained");
	Ok(())
}
