//! The `Updater` contract: a user-supplied join over a lattice value type `V`.

/// A user-supplied lattice join.
///
/// `bottom` is the initial value of every cell using this updater.
/// `update(current, incoming)` **must** be monotone and idempotent:
/// `update(x, x) == x`, `update(x, y) ⊒ x`, `update(x, y) ⊒ y`, and `update`
/// must never decrease. An incoming value that is incompatible with
/// monotonicity should be rejected with [`NotMonotonic`] rather than
/// silently regressing the cell.
pub trait Updater: Send + Sync + 'static {
	/// The lattice element type.
	type Value: Clone + PartialEq + Send + Sync + 'static;

	/// The distinguished bottom element.
	fn bottom(&self) -> Self::Value;

	/// Joins `incoming` into `current`, returning the new value.
	///
	/// # Errors
	///
	/// Returns [`NotMonotonic`] if `incoming` is incompatible with the
	/// lattice's monotonicity contract relative to `current`.
	fn update(
		&self,
		current: &Self::Value,
		incoming: &Self::Value,
	) -> Result<Self::Value, NotMonotonic>;

	/// When `true`, incoming values on an already-final cell that would
	/// change its value are silently dropped instead of surfacing
	/// [`crate::error::EngineError::AlreadyFinal`].
	fn ignore_if_final(&self) -> bool {
		false
	}
}

/// Signal raised by [`Updater::update`] to reject an incoming join.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotMonotonic;
