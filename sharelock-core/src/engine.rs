use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::key::{ClientId, Key};
use crate::outcome::Outcome;
use crate::waiter::Waiter;

/// A constructed, not-yet-running lock engine.
///
/// [`Engine::start`] spawns the dispatcher task and returns a cloneable
/// [`EngineHandle`] that front ends use to submit lock and unlock requests.
pub struct Engine {
	config: EngineConfig,
	lock_tx: mpsc::Sender<Waiter>,
	lock_rx: mpsc::Receiver<Waiter>,
	unlock_tx: mpsc::Sender<Waiter>,
	unlock_rx: mpsc::Receiver<Waiter>,
}

impl Engine {
	pub fn new(config: EngineConfig) -> Self {
		let (lock_tx, lock_rx) = mpsc::channel(config.submission_channel_capacity);
		let (unlock_tx, unlock_rx) = mpsc::channel(config.submission_channel_capacity);
		Engine {
			config,
			lock_tx,
			lock_rx,
			unlock_tx,
			unlock_rx,
		}
	}

	/// Spawns the dispatcher loop and returns a handle front ends can clone and share
	/// freely. The dispatcher stops, abandoning any in-flight waiters without
	/// resolving them, when `shutdown` is cancelled.
	pub fn start(self, shutdown: CancellationToken) -> EngineHandle {
		let dispatcher = Dispatcher::new(self.config, self.lock_rx, self.unlock_rx);
		tokio::spawn(dispatcher.run(shutdown.clone()));
		EngineHandle {
			lock_tx: self.lock_tx,
			unlock_tx: self.unlock_tx,
			shutdown,
		}
	}
}

/// A cheaply cloneable submission point into a running engine.
#[derive(Clone)]
pub struct EngineHandle {
	lock_tx: mpsc::Sender<Waiter>,
	unlock_tx: mpsc::Sender<Waiter>,
	shutdown: CancellationToken,
}

impl EngineHandle {
	/// Attempts to acquire `key` on behalf of `client_id`, waiting up to `timeout` (or
	/// indefinitely if `None`) and giving up early if `cancel` fires first.
	///
	/// `timeout` and any front-end default-substitution for a non-positive
	/// `timeout_ms` must already be resolved by the caller; the engine only ever sees
	/// a concrete bound or none at all.
	pub async fn lock(&self, client_id: ClientId, key: Key, timeout: Option<Duration>, cancel: CancellationToken) -> Outcome {
		if client_id.is_empty() || key.is_empty() {
			return Outcome::InvalidRequest;
		}

		// `wait_cancel` is handed to the waiter so a key-state that dequeues it after
		// we have already given up can tell not to grant it. It is flipped from
		// inside this select, never from a background task: nothing else needs to
		// observe it live before the corresponding branch below returns anyway.
		let wait_cancel = CancellationToken::new();
		let (waiter, outcome_rx) = Waiter::new(client_id, key, wait_cancel.clone(), timeout);
		if self.lock_tx.send(waiter).await.is_err() {
			return Outcome::Timeout;
		}

		tokio::select! {
			result = outcome_rx => result.unwrap_or(Outcome::Timeout),
			_ = cancel.cancelled() => { wait_cancel.cancel(); Outcome::Timeout }
			_ = self.shutdown.cancelled() => { wait_cancel.cancel(); Outcome::Timeout }
			_ = sleep_or_pending(timeout) => { wait_cancel.cancel(); Outcome::Timeout }
		}
	}

	/// Releases `key` on behalf of `client_id`. Returns [`Outcome::Released`] only if
	/// `client_id` is the current holder; otherwise [`Outcome::UnknownLock`].
	pub async fn unlock(&self, client_id: ClientId, key: Key) -> Outcome {
		if client_id.is_empty() || key.is_empty() {
			return Outcome::InvalidRequest;
		}

		let (waiter, outcome_rx) = Waiter::new(client_id, key, CancellationToken::new(), None);
		if self.unlock_tx.send(waiter).await.is_err() {
			warn!("dispatcher unavailable for unlock submission");
			return Outcome::UnknownLock;
		}
		outcome_rx.await.unwrap_or(Outcome::UnknownLock)
	}
}

async fn sleep_or_pending(timeout: Option<Duration>) {
	match timeout {
		Some(d) => tokio::time::sleep(d).await,
		None => std::future::pending().await,
	}
}
