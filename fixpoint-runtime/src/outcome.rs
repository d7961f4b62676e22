//! [`Outcome`], the tagged sum returned by user callbacks and `init` functions.

/// Result of a user callback or `init` function, describing how a value
/// should affect the cell it targets.
#[derive(Debug, Clone)]
pub enum Outcome<V> {
	/// Finalizes the target cell with `v` (joined with its current value).
	Final(V),
	/// Joins `v` into the target cell without finalizing it.
	Next(V),
	/// Leaves the target cell unchanged.
	None,
}

impl<V> Outcome<V> {
	/// `true` iff this outcome is [`Outcome::None`].
	pub fn is_none(&self) -> bool {
		matches!(self, Outcome::None)
	}

	/// `true` iff this outcome is [`Outcome::Final`].
	pub fn is_final(&self) -> bool {
		matches!(self, Outcome::Final(_))
	}
}
