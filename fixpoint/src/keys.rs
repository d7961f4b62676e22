//! Ready-made cycle-resolution policies.

use std::sync::Arc;

use fixpoint_runtime::{Cell, Key, Updater};

/// Resolves any closed SCC or leftover incomplete cell to a fixed constant,
/// regardless of the cell's current value. Useful when the domain has an
/// obvious safe default (e.g. "no result" or "empty") for anything the
/// dependency graph cannot settle on its own.
pub struct ConstantKey<V> {
	value: V,
}

impl<V: Clone> ConstantKey<V> {
	pub fn new(value: V) -> Self {
		Self { value }
	}
}

impl<V, U> Key<V, U> for ConstantKey<V>
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	fn resolve(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)> {
		cells.iter().map(|c| (Arc::clone(c), self.value.clone())).collect()
	}

	fn fallback(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)> {
		cells.iter().map(|c| (Arc::clone(c), self.value.clone())).collect()
	}
}

/// Resolves by taking each cell's own current value as final: a closed SCC
/// is "correct" wherever it has converged, and nothing more can be learned
/// about it. The common choice for lattices without an obvious fallback
/// default.
pub struct CurrentValueKey;

impl<V, U> Key<V, U> for CurrentValueKey
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	fn resolve(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)> {
		cells.iter().map(|c| (Arc::clone(c), c.get_result())).collect()
	}

	fn fallback(&self, cells: &[Arc<Cell<V, U>>]) -> Vec<(Arc<Cell<V, U>>, V)> {
		cells.iter().map(|c| (Arc::clone(c), c.get_result())).collect()
	}
}
