use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::key::{ClientId, Key};
use crate::outcome::Outcome;

/// A single admitted lock request, queued on a key-state's inbox until it reaches the
/// head and is either granted or found already cancelled.
///
/// `outcome_tx` is a `oneshot`, not an unbuffered rendezvous channel: the send always
/// succeeds as soon as a receiver exists, even if nobody is polling the receiver yet.
/// That is the whole point of choosing it here, since the key-state that resolves a
/// waiter must never block on the caller being ready to receive.
pub(crate) struct Waiter {
	pub client_id: ClientId,
	pub key: Key,
	pub cancel: CancellationToken,
	/// The caller's requested `timeout_ms`, already resolved to a concrete duration.
	/// Consulted only if this waiter is granted: the key-state folds it into the
	/// holder-timeout alongside the service-wide cap (spec §4.2).
	pub requested_timeout: Option<Duration>,
	outcome_tx: oneshot::Sender<Outcome>,
}

impl Waiter {
	pub fn new(client_id: ClientId, key: Key, cancel: CancellationToken, requested_timeout: Option<Duration>) -> (Self, oneshot::Receiver<Outcome>) {
		let (outcome_tx, outcome_rx) = oneshot::channel();
		let waiter = Waiter {
			client_id,
			key,
			cancel,
			requested_timeout,
			outcome_tx,
		};
		(waiter, outcome_rx)
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Delivers the final outcome. `outcome` must never be [`Outcome::Timeout`]: that
	/// value is synthesized at the boundary, not produced by the engine.
	pub fn resolve(self, outcome: Outcome) {
		debug_assert_ne!(outcome, Outcome::Timeout, "engine must never resolve a waiter with Timeout");
		// A dropped receiver means the caller already gave up (its own cancellation
		// raced this grant); nothing to do but drop the outcome.
		let _ = self.outcome_tx.send(outcome);
	}
}
