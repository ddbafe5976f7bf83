use std::time::Duration;

/// Tunables for a single engine instance. All of these are ambient knobs (capacity
/// bounds, reap cadence); none of them change lock semantics.
#[derive(Clone, Copy, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
	/// Bound on the dispatcher's lock/unlock submission channels. Generous by design;
	/// reaching it means callers are submitting faster than the single dispatcher loop
	/// can admit work, which is a capacity problem rather than a correctness one.
	pub submission_channel_capacity: usize,
	/// Bound on a single key's waiter inbox. Reaching this is a symptom of
	/// pathological contention on one key and is logged, not treated as an error.
	pub per_key_inbox_capacity: usize,
	/// Upper bound placed on every holder's timeout, regardless of what the holder
	/// requested. Keeps a misbehaving or absent-minded client from holding a key
	/// forever.
	pub holder_timeout_cap_ms: u64,
	/// Cadence at which an idle key-state checks whether it should retire.
	pub idle_tick_ms: u64,
}

impl EngineConfig {
	pub fn holder_timeout_cap(&self) -> Duration {
		Duration::from_millis(self.holder_timeout_cap_ms)
	}

	pub fn idle_tick(&self) -> Duration {
		Duration::from_millis(self.idle_tick_ms)
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		EngineConfig {
			submission_channel_capacity: 10_000,
			per_key_inbox_capacity: 256,
			holder_timeout_cap_ms: 10_000,
			idle_tick_ms: 60_000,
		}
	}
}
