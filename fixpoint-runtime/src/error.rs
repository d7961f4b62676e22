//! Error kinds surfaced by the engine, per the propagation policy: value-update
//! errors return synchronously to the caller of `put_next`/`put_final`, while
//! callback failures are only ever observed through the pool's unhandled-
//! exception handler.

use thiserror::Error;

/// Errors the engine can report.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
	/// A `put_next`/`put_final` call would change an already-final cell's value,
	/// or would finalize it with a value incompatible with its existing final
	/// value.
	#[error("cell is already final and the incoming value would change it")]
	AlreadyFinal,

	/// The updater rejected an incoming join as incompatible with monotonicity.
	#[error("updater rejected an incoming value as not monotonic")]
	NotMonotonic,

	/// A user `init` function or callback panicked. Routed to the pool's
	/// unhandled-exception handler; never returned to the producer that
	/// triggered the panicking code indirectly.
	#[error("a user callback or init function panicked")]
	CallbackFailure,

	/// A task was submitted to a `HandlerPool` after `shutdown()` was called.
	#[error("task submitted after pool shutdown")]
	ShutdownInProgress,
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, EngineError>;
