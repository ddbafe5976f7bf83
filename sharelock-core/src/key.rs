use std::sync::Arc;

/// A lock name. Opaque to the engine: never interpreted, only compared and hashed.
pub type Key = bytes::Bytes;

/// A caller-supplied identity used to decide who may release a lock.
///
/// `Arc<str>` rather than `String` because the same id is cloned into every waiter a
/// client submits and, once a lock is held, cached again in the dispatcher's view of
/// that key.
pub type ClientId = Arc<str>;
