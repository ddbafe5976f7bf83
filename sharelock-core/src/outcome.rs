use std::fmt;

/// The terminal result of a lock or unlock attempt.
///
/// The engine itself only ever produces [`Outcome::Acquired`], [`Outcome::Released`],
/// [`Outcome::UnknownLock`] and [`Outcome::InvalidRequest`]. [`Outcome::Timeout`] is
/// never written into a waiter's outcome slot by the dispatcher or a key-state; it is
/// synthesized by [`crate::engine::EngineHandle`] when a caller's wait is cancelled
/// before the engine delivers one of the other four.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
	/// The lock was granted to this waiter.
	Acquired,
	/// An unlock matched the current holder and the lock was released.
	Released,
	/// The caller's wait was cancelled (deadline, disconnect, or shutdown) before a
	/// grant arrived.
	Timeout,
	/// An unlock was submitted for a key with no matching holder, or by a client that
	/// is not the current holder.
	UnknownLock,
	/// The request itself was malformed (empty key, missing client id) and was never
	/// admitted to the dispatcher.
	InvalidRequest,
}

impl fmt::Display for Outcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Outcome::Acquired => "acquired",
			Outcome::Released => "released",
			Outcome::Timeout => "timeout",
			Outcome::UnknownLock => "unknown_lock",
			Outcome::InvalidRequest => "invalid_request",
		};
		f.write_str(s)
	}
}
