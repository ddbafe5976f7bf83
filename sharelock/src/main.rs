// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::net::SocketAddr;
use std::path::PathBuf;

use agent_core::{drain, signal, telemetry, version};
use clap::Parser;
use sharelock_core::Engine;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod error;
mod grpc;
mod http;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long, value_name = "file", default_value = "./config.yaml")]
	file: PathBuf,

	/// Parse and validate the configuration, then exit without binding any listener.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	let cfg = config::load(&args.file)?;
	telemetry::setup_logging(cfg.log_format, &cfg.log_level);
	info!(version = %version::BuildInfo::new(), file = %args.file.display(), "sharelock starting");

	if args.validate_only {
		info!("configuration is valid");
		return Ok(());
	}

	if !cfg.http.enable && !cfg.grpc.enable {
		error!("no front end enabled, nothing to serve");
		return Ok(());
	}

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	// The engine's own cancellation is independent of the drain: spec §6 says
	// `Shutdown()` fires the engine-wide cancellation immediately, so every
	// outstanding waiter observes it and the front end maps that to `Timeout`,
	// while the drain below separately gives in-flight HTTP/gRPC connections a
	// chance to write that response back before the listeners close.
	let engine_shutdown = CancellationToken::new();
	let engine = Engine::new(cfg.engine).start(engine_shutdown.clone());

	let mut front_ends = JoinSet::new();

	if cfg.http.enable {
		let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
		let engine = engine.clone();
		let drain = drain_rx.clone();
		info!(%addr, service = %cfg.http.service_name, "http front end enabled");
		front_ends.spawn(async move { http::serve(addr, engine, drain).await.map_err(anyhow::Error::from) });
	}

	if cfg.grpc.enable {
		let addr = SocketAddr::from(([0, 0, 0, 0], cfg.grpc.port));
		let engine = engine.clone();
		let drain = drain_rx.clone();
		let tls = cfg.grpc_tls.clone();
		info!(%addr, service = %cfg.grpc.service_name, tls = tls.is_some(), "grpc front end enabled");
		front_ends.spawn(async move { grpc::serve(addr, engine, tls, drain).await.map_err(anyhow::Error::from) });
	}

	// Drop our own clone so the trigger below only waits on the front ends' copies.
	drop(drain_rx);

	shutdown.wait().await;
	info!("shutdown requested, draining front ends");
	engine_shutdown.cancel();
	drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;

	while let Some(result) = front_ends.join_next().await {
		match result {
			Ok(Ok(())) => {}
			Ok(Err(err)) => error!(%err, "front end exited with an error"),
			Err(err) => error!(%err, "front end task panicked"),
		}
	}

	info!("shutdown complete");
	Ok(())
}
