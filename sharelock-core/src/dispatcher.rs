use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::EngineConfig;
use crate::key::{ClientId, Key};
use crate::key_state::{Generation, KeyEvent, KeyState};
use crate::outcome::Outcome;
use crate::waiter::Waiter;

struct KeyEntry {
	generation: Generation,
	inbox_tx: mpsc::Sender<Waiter>,
	release_tx: mpsc::Sender<()>,
	pending: Arc<AtomicUsize>,
	holder_id: Option<ClientId>,
}

/// The single task that owns the key-name-to-key-state map.
///
/// All map mutation happens here and only here; a key-state never touches the map,
/// only its own queue and holder timer. The dispatcher learns about holder changes
/// made inside a key-state (a grant, a timeout-driven reclaim, a retirement) through
/// `events_rx`, and every such event is tagged with the generation of the key-state
/// that produced it so a message from an instance that has already retired can never
/// be mistaken for one describing the map's current (possibly brand new) entry.
pub(crate) struct Dispatcher {
	config: EngineConfig,
	keys: HashMap<Key, KeyEntry>,
	next_generation: Generation,
	lock_rx: mpsc::Receiver<Waiter>,
	unlock_rx: mpsc::Receiver<Waiter>,
	events_tx: mpsc::Sender<KeyEvent>,
	events_rx: mpsc::Receiver<KeyEvent>,
}

impl Dispatcher {
	pub fn new(config: EngineConfig, lock_rx: mpsc::Receiver<Waiter>, unlock_rx: mpsc::Receiver<Waiter>) -> Self {
		let (events_tx, events_rx) = mpsc::channel(config.submission_channel_capacity);
		Dispatcher {
			config,
			keys: HashMap::new(),
			next_generation: 0,
			lock_rx,
			unlock_rx,
			events_tx,
			events_rx,
		}
	}

	pub async fn run(mut self, shutdown: CancellationToken) {
		loop {
			tokio::select! {
				biased;

				_ = shutdown.cancelled() => {
					info!(open_keys = self.keys.len(), "dispatcher shutting down");
					return;
				}

				Some(event) = self.events_rx.recv() => {
					self.handle_event(event);
				}

				Some(waiter) = self.lock_rx.recv() => {
					self.handle_lock(waiter).await;
				}

				Some(waiter) = self.unlock_rx.recv() => {
					self.handle_unlock(waiter);
				}

				else => return,
			}
		}
	}

	fn handle_event(&mut self, event: KeyEvent) {
		match event {
			KeyEvent::Granted { key, generation, holder } => {
				if let Some(entry) = self.keys.get_mut(&key) {
					if entry.generation == generation {
						entry.holder_id = Some(holder);
					}
				}
			}
			KeyEvent::Reclaimed { key, generation } => {
				if let Some(entry) = self.keys.get_mut(&key) {
					if entry.generation == generation {
						entry.holder_id = None;
					}
				}
			}
			KeyEvent::Retired { key, generation } => {
				if let std::collections::hash_map::Entry::Occupied(entry) = self.keys.entry(key.clone()) {
					if entry.get().generation == generation {
						entry.remove();
						trace!(?key, "retired key-state removed from map");
					}
				}
			}
		}
	}

	async fn handle_lock(&mut self, waiter: Waiter) {
		let key = waiter.key.clone();
		let existing = self.keys.get(&key).map(|entry| (entry.inbox_tx.clone(), entry.pending.clone()));
		let Some((inbox_tx, pending)) = existing else {
			self.spawn_key_state(key, waiter);
			return;
		};

		pending.fetch_add(1, Ordering::AcqRel);
		match inbox_tx.try_send(waiter) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Closed(waiter)) => {
				// The key-state retired and we have not yet processed its
				// retirement event. The pending bump above belonged to the entry we
				// are about to replace; the replacement starts its own count fresh.
				pending.fetch_sub(1, Ordering::AcqRel);
				self.spawn_key_state(key, waiter);
			}
			Err(mpsc::error::TrySendError::Full(waiter)) => {
				warn!(?key, "per-key inbox full, awaiting capacity");
				// The dispatcher is a single-consumer loop: blocking here stalls
				// every other key too. Reaching this branch is a pathological,
				// logged condition, not a normal operating point.
				if let Err(mpsc::error::SendError(waiter)) = inbox_tx.send(waiter).await {
					pending.fetch_sub(1, Ordering::AcqRel);
					self.spawn_key_state(key, waiter);
				}
			}
		}
	}

	fn spawn_key_state(&mut self, key: Key, waiter: Waiter) {
		let generation = self.next_generation;
		self.next_generation += 1;

		let (inbox_tx, inbox_rx) = mpsc::channel(self.config.per_key_inbox_capacity);
		let (release_tx, release_rx) = mpsc::channel(1);
		let pending = Arc::new(AtomicUsize::new(1));

		inbox_tx.try_send(waiter).expect("fresh channel has capacity for its first waiter");

		let key_state = KeyState::new(key.clone(), generation, inbox_rx, release_rx, self.events_tx.clone(), pending.clone(), &self.config);
		tokio::spawn(key_state.run());

		self.keys.insert(
			key,
			KeyEntry {
				generation,
				inbox_tx,
				release_tx,
				pending,
				holder_id: None,
			},
		);
	}

	fn handle_unlock(&mut self, waiter: Waiter) {
		let key = waiter.key.clone();
		let matched = self
			.keys
			.get(&key)
			.is_some_and(|entry| entry.holder_id.as_ref() == Some(&waiter.client_id));

		if !matched {
			waiter.resolve(Outcome::UnknownLock);
			return;
		}

		let entry = self.keys.get_mut(&key).expect("matched above");
		entry.holder_id = None;
		waiter.resolve(Outcome::Released);
		let _ = entry.release_tx.try_send(());
	}
}
