//! Ready-made lattices for common cases, so callers don't have to write an
//! [`Updater`] from scratch for the simplest shapes.

use std::{collections::HashSet, hash::Hash};

use fixpoint_runtime::{NotMonotonic, Updater};

/// A flat lattice: bottom, then any number of distinct values, all mutually
/// incomparable above bottom. Joining two different non-bottom values is a
/// monotonicity violation — there is no value above both.
pub struct Flat<T> {
	bottom: Option<T>,
}

impl<T> Flat<T> {
	/// A flat lattice whose bottom is `None`, wrapping values in `Some`.
	pub fn new() -> Self {
		Self { bottom: None }
	}
}

impl<T> Default for Flat<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Updater for Flat<T> {
	type Value = Option<T>;

	fn bottom(&self) -> Self::Value {
		self.bottom.clone()
	}

	fn update(&self, current: &Self::Value, incoming: &Self::Value) -> Result<Self::Value, NotMonotonic> {
		match (current, incoming) {
			(None, v) => Ok(v.clone()),
			(v, None) => Ok(v.clone()),
			(Some(a), Some(b)) if a == b => Ok(Some(a.clone())),
			(Some(_), Some(_)) => Err(NotMonotonic),
		}
	}
}

/// The union-of-sets lattice: join is set union, ordered by inclusion.
pub struct SetUnion<T> {
	_marker: std::marker::PhantomData<T>,
}

impl<T> SetUnion<T> {
	pub fn new() -> Self {
		Self {
			_marker: std::marker::PhantomData,
		}
	}
}

impl<T> Default for SetUnion<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> Updater for SetUnion<T> {
	type Value = HashSet<T>;

	fn bottom(&self) -> Self::Value {
		HashSet::new()
	}

	fn update(&self, current: &Self::Value, incoming: &Self::Value) -> Result<Self::Value, NotMonotonic> {
		Ok(current.union(incoming).cloned().collect())
	}
}

/// The max-of-numbers lattice: join is the larger of the two values, ordered
/// by the natural numeric order.
pub struct MaxNum;

impl Updater for MaxNum {
	type Value = i64;

	fn bottom(&self) -> Self::Value {
		i64::MIN
	}

	fn update(&self, current: &Self::Value, incoming: &Self::Value) -> Result<Self::Value, NotMonotonic> {
		Ok((*current).max(*incoming))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flat_accepts_repeated_value() {
		let u = Flat::<&str>::new();
		let joined = u.update(&Some("a"), &Some("a")).unwrap();
		assert_eq!(joined, Some("a"));
	}

	#[test]
	fn flat_rejects_conflicting_value() {
		let u = Flat::<&str>::new();
		assert!(u.update(&Some("a"), &Some("b")).is_err());
	}

	#[test]
	fn set_union_grows_monotonically() {
		let u = SetUnion::<i32>::new();
		let mut a = HashSet::new();
		a.insert(1);
		let mut b = HashSet::new();
		b.insert(2);
		let joined = u.update(&a, &b).unwrap();
		assert_eq!(joined.len(), 2);
	}

	#[test]
	fn max_num_never_decreases() {
		let u = MaxNum;
		assert_eq!(u.update(&3, &5).unwrap(), 5);
		assert_eq!(u.update(&5, &3).unwrap(), 5);
	}
}
