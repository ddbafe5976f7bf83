use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::EngineConfig;
use crate::key::{ClientId, Key};
use crate::outcome::Outcome;
use crate::waiter::Waiter;

/// Generation counter distinguishing successive key-state instances for the same key.
///
/// A key-state can decide to retire and a fresh Lock submission for the same key can
/// arrive before the dispatcher has processed the retirement announcement. The
/// dispatcher reacts to that by spawning a brand new key-state immediately, so two
/// `KeyEvent`s that both name the same key may originate from two different actors.
/// Every event this module emits carries the generation it was spawned with, and the
/// dispatcher discards any event whose generation no longer matches its live entry.
pub(crate) type Generation = u64;

pub(crate) enum KeyEvent {
	/// A waiter at the head of the queue was granted the lock.
	Granted { key: Key, generation: Generation, holder: ClientId },
	/// The previous holder's timeout elapsed and the key reclaimed itself without an
	/// explicit unlock.
	Reclaimed { key: Key, generation: Generation },
	/// The key-state found itself idle (no holder, empty inbox) and exited. No more
	/// messages will ever be accepted on its inbox.
	Retired { key: Key, generation: Generation },
}

enum State {
	Idle,
	Held { holder: ClientId, deadline: Instant },
}

/// The actor owning one key's FIFO queue and current holder.
///
/// The queue is the inbox channel itself: `tokio::sync::mpsc` already preserves
/// arrival order, so there is no separate `VecDeque` staging buffer to keep in sync
/// with it.
pub(crate) struct KeyState {
	key: Key,
	generation: Generation,
	inbox_rx: mpsc::Receiver<Waiter>,
	release_rx: mpsc::Receiver<()>,
	events_tx: mpsc::Sender<KeyEvent>,
	pending: Arc<AtomicUsize>,
	holder_timeout_cap: Duration,
	idle_tick: Duration,
	state: State,
}

impl KeyState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		key: Key,
		generation: Generation,
		inbox_rx: mpsc::Receiver<Waiter>,
		release_rx: mpsc::Receiver<()>,
		events_tx: mpsc::Sender<KeyEvent>,
		pending: Arc<AtomicUsize>,
		config: &EngineConfig,
	) -> Self {
		KeyState {
			key,
			generation,
			inbox_rx,
			release_rx,
			events_tx,
			pending,
			holder_timeout_cap: config.holder_timeout_cap(),
			idle_tick: config.idle_tick(),
			state: State::Idle,
		}
	}

	/// Drives this key until it retires. Starts `Idle`: the caller (the dispatcher)
	/// has already enqueued the waiter that justified creating this key-state before
	/// spawning this task, so the first loop iteration below finds it on `inbox_rx`
	/// and grants it immediately.
	pub async fn run(mut self) {
		let mut ticker = tokio::time::interval(self.idle_tick);
		ticker.tick().await; // first tick fires immediately; discard it

		loop {
			match &self.state {
				State::Held { holder, deadline } => {
					let holder = holder.clone();
					let deadline = *deadline;
					tokio::select! {
						biased;

						_ = tokio::time::sleep_until(deadline) => {
							debug!(key = ?self.key, holder = %holder, "holder timeout elapsed, reclaiming");
							if self.events_tx.send(KeyEvent::Reclaimed { key: self.key.clone(), generation: self.generation }).await.is_err() {
								return;
							}
							self.state = State::Idle;
						}

						signal = self.release_rx.recv() => {
							if signal.is_none() {
								// Dispatcher dropped our release sender; it is gone, we
								// cannot be reached anymore. Retire quietly.
								return;
							}
							self.state = State::Idle;
						}
					}
				}

				State::Idle => {
					tokio::select! {
						biased;

						waiter = self.inbox_rx.recv() => {
							match waiter {
								Some(waiter) => {
									self.pending.fetch_sub(1, Ordering::AcqRel);
									self.grant_next(waiter).await;
								}
								None => {
									self.retire().await;
									return;
								}
							}
						}

						_ = ticker.tick() => {
							if self.pending.load(Ordering::Acquire) == 0 {
								trace!(key = ?self.key, "idle tick found empty queue, retiring");
								self.retire().await;
								return;
							}
						}
					}
				}
			}
		}
	}

	/// Grants `candidate` if it is still live, skipping over (and discarding) any
	/// already-cancelled waiters found ahead of it without waiting on the inbox again.
	/// Leaves `self.state` as `Idle` if the inbox runs dry before a live one turns up.
	async fn grant_next(&mut self, mut candidate: Waiter) {
		loop {
			if candidate.is_cancelled() {
				trace!(key = ?self.key, client = %candidate.client_id, "skipping cancelled waiter");
				// Dropping, not resolving: the caller's own wait already raced its
				// cancellation token to a Timeout independently, and Waiter::resolve
				// must never be handed Outcome::Timeout.
				drop(candidate);
				match self.inbox_rx.try_recv() {
					Ok(next) => {
						self.pending.fetch_sub(1, Ordering::AcqRel);
						candidate = next;
						continue;
					}
					Err(_) => return,
				}
			}

			let holder = candidate.client_id.clone();
			let holder_timeout = match candidate.requested_timeout {
				Some(requested) => requested.min(self.holder_timeout_cap),
				None => self.holder_timeout_cap,
			};
			candidate.resolve(Outcome::Acquired);
			let deadline = Instant::now() + holder_timeout;
			self.state = State::Held {
				holder: holder.clone(),
				deadline,
			};
			let _ = self
				.events_tx
				.send(KeyEvent::Granted {
					key: self.key.clone(),
					generation: self.generation,
					holder,
				})
				.await;
			return;
		}
	}

	/// Announces retirement to the dispatcher. After this call the dispatcher may
	/// spawn a fresh key-state for this key at any time; this instance must not touch
	/// `inbox_rx` again.
	async fn retire(&mut self) {
		let _ = self
			.events_tx
			.send(KeyEvent::Retired {
				key: self.key.clone(),
				generation: self.generation,
			})
			.await;
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::AtomicUsize;

	use tokio::sync::mpsc;
	use tokio_util::sync::CancellationToken;

	use super::*;

	fn cfg() -> EngineConfig {
		EngineConfig {
			submission_channel_capacity: 16,
			per_key_inbox_capacity: 16,
			holder_timeout_cap_ms: 60_000,
			idle_tick_ms: 60_000,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn grants_single_waiter_immediately() {
		let (inbox_tx, inbox_rx) = mpsc::channel(4);
		let (_release_tx, release_rx) = mpsc::channel(4);
		let (events_tx, mut events_rx) = mpsc::channel(4);
		let pending = Arc::new(AtomicUsize::new(1));

		let (waiter, outcome_rx) = Waiter::new("alice".into(), Key::from_static(b"k"), CancellationToken::new(), None);
		inbox_tx.try_send(waiter).unwrap();

		let key_state = KeyState::new(Key::from_static(b"k"), 0, inbox_rx, release_rx, events_tx, pending, &cfg());
		tokio::spawn(key_state.run());

		let outcome = outcome_rx.await.unwrap();
		assert_eq!(outcome, Outcome::Acquired);

		match events_rx.recv().await.unwrap() {
			KeyEvent::Granted { holder, .. } => assert_eq!(&*holder, "alice"),
			_ => panic!("expected Granted"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn retires_when_inbox_empty_on_release() {
		let (inbox_tx, inbox_rx) = mpsc::channel(4);
		let (release_tx, release_rx) = mpsc::channel(4);
		let (events_tx, mut events_rx) = mpsc::channel(4);
		let pending = Arc::new(AtomicUsize::new(1));

		let (waiter, outcome_rx) = Waiter::new("alice".into(), Key::from_static(b"k"), CancellationToken::new(), None);
		inbox_tx.try_send(waiter).unwrap();

		let key_state = KeyState::new(Key::from_static(b"k"), 0, inbox_rx, release_rx, events_tx, pending, &cfg());
		let handle = tokio::spawn(key_state.run());

		assert_eq!(outcome_rx.await.unwrap(), Outcome::Acquired);
		match events_rx.recv().await.unwrap() {
			KeyEvent::Granted { .. } => {}
			_ => panic!("expected Granted"),
		}

		release_tx.send(()).await.unwrap();
		match events_rx.recv().await.unwrap() {
			KeyEvent::Retired { .. } => {}
			other => panic!("expected Retired, got a different event: {:?}", matches!(other, KeyEvent::Granted { .. })),
		}

		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn reclaims_after_holder_timeout() {
		let (inbox_tx, inbox_rx) = mpsc::channel(4);
		let (_release_tx, release_rx) = mpsc::channel(4);
		let (events_tx, mut events_rx) = mpsc::channel(4);
		let pending = Arc::new(AtomicUsize::new(1));

		let (waiter, outcome_rx) = Waiter::new("alice".into(), Key::from_static(b"k"), CancellationToken::new(), None);
		inbox_tx.try_send(waiter).unwrap();

		let mut short_cfg = cfg();
		short_cfg.holder_timeout_cap_ms = 10;
		let key_state = KeyState::new(Key::from_static(b"k"), 0, inbox_rx, release_rx, events_tx, pending, &short_cfg);
		tokio::spawn(key_state.run());

		assert_eq!(outcome_rx.await.unwrap(), Outcome::Acquired);
		matches!(events_rx.recv().await.unwrap(), KeyEvent::Granted { .. });

		tokio::time::advance(Duration::from_millis(20)).await;
		match events_rx.recv().await.unwrap() {
			KeyEvent::Reclaimed { .. } => {}
			_ => panic!("expected Reclaimed"),
		}
	}
}
