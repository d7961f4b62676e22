//! The `Key` contract: per-cell cycle-resolution and fallback policies.

use std::sync::Arc;

use crate::{cell::Cell, lattice::Updater};

/// Per-cell resolution policy, invoked by the pool on closed SCCs of
/// non-final cells and on cells that survive cycle resolution.
///
/// Both methods must return values consistent with monotonicity relative to
/// each cell's current value; the engine applies them via
/// [`Cell::resolve_with_value`].
pub trait Key<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>>: Send + Sync + 'static {
	/// Invoked on a closed strongly connected component of non-final cells.
	/// The key used is that of the component's head cell. Returns a
	/// finalization value for each cell in `cells` that should be resolved
	/// (cells absent from the returned list are left untouched).
	fn resolve(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)>;

	/// Invoked on non-final cells that survived cycle resolution. Returns a
	/// finalization value for each cell in `cells` that should be resolved.
	fn fallback(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)>;
}
