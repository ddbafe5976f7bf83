use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("parsing config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
	#[error("binding {addr}: {source}")]
	Bind { addr: SocketAddr, #[source] source: std::io::Error },
	#[error("loading TLS credentials from {path}: {source}")]
	Tls { path: String, #[source] source: std::io::Error },
	#[error("no private key found in {0}")]
	NoPrivateKey(String),
	#[error("starting gRPC transport: {0}")]
	Grpc(#[from] tonic::transport::Error),
}
