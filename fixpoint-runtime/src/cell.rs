//! The cell state machine: lattice join, callback registration, dependency
//! bookkeeping, and completion.

use std::{
	hash::{Hash, Hasher},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Weak,
	},
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::DashSet;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
	callback::{CallbackBody, CallbackRecord, Dispatch, SequentialGate},
	error::{EngineError, Result},
	key::Key,
	lattice::Updater,
	outcome::Outcome,
	pool::HandlerPoolInner,
};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, stable identity for a cell, used for dependency bookkeeping and
/// SCC discovery. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(u64);

impl CellId {
	fn fresh() -> Self {
		CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
	}
}

enum CellValue<V> {
	Incomplete(V),
	/// Always the success arm in this build: no operation in the public
	/// contract produces a failed final value, so the failure arm that the
	/// data model allows for is not populated here.
	Final(V),
}

type Init<V, U> = Box<dyn FnOnce(&Arc<Cell<V, U>>) -> Outcome<V> + Send>;

/// A monotonically growing container of a value drawn from a user-defined
/// lattice, with registrable dependency callbacks.
///
/// `Cell`'s value is a single lock-free atomic reference (`res`); dependency
/// sets and callback maps are separate concurrent collections so that
/// advancing `res` never needs to hold a lock across user callback
/// execution.
pub struct Cell<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> {
	id: CellId,
	updater: Arc<U>,
	/// `None` only for cells created already-final via
	/// [`crate::pool::HandlerPool::create_completed_cell`], which never need
	/// resolving.
	key: Option<Arc<dyn Key<V, U>>>,
	state: ArcSwap<CellValue<V>>,
	tasks_active: AtomicBool,
	init: Mutex<Option<Init<V, U>>>,
	next_deps: DashSet<Arc<Cell<V, U>>>,
	complete_deps: DashSet<Arc<Cell<V, U>>>,
	next_callbacks: DashMap<CellId, Vec<CallbackRecord<V, U>>>,
	complete_callbacks: DashMap<CellId, Vec<CallbackRecord<V, U>>>,
	sequential_gate: Arc<SequentialGate>,
	pool: Weak<HandlerPoolInner<V, U>>,
}

impl<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> PartialEq for Cell<V, U> {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}
impl<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> Eq for Cell<V, U> {}
impl<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> Hash for Cell<V, U> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state)
	}
}

impl<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> Cell<V, U> {
	pub(crate) fn new_incomplete(
		pool: &Arc<HandlerPoolInner<V, U>>,
		updater: Arc<U>,
		key: Arc<dyn Key<V, U>>,
		init: Init<V, U>,
	) -> Arc<Self> {
		let bottom = updater.bottom();
		let id = CellId::fresh();
		trace!(cell = id.0, "cell created");
		Arc::new(Self {
			id,
			updater,
			key: Some(key),
			state: ArcSwap::new(Arc::new(CellValue::Incomplete(bottom))),
			tasks_active: AtomicBool::new(false),
			init: Mutex::new(Some(init)),
			next_deps: DashSet::new(),
			complete_deps: DashSet::new(),
			next_callbacks: DashMap::new(),
			complete_callbacks: DashMap::new(),
			sequential_gate: Arc::new(SequentialGate::new()),
			pool: Arc::downgrade(pool),
		})
	}

	pub(crate) fn new_completed(pool: &Arc<HandlerPoolInner<V, U>>, updater: Arc<U>, value: V) -> Arc<Self> {
		let id = CellId::fresh();
		trace!(cell = id.0, "cell created (already final)");
		Arc::new(Self {
			id,
			updater,
			key: None,
			state: ArcSwap::new(Arc::new(CellValue::Final(value))),
			tasks_active: AtomicBool::new(true),
			init: Mutex::new(None),
			next_deps: DashSet::new(),
			complete_deps: DashSet::new(),
			next_callbacks: DashMap::new(),
			complete_callbacks: DashMap::new(),
			sequential_gate: Arc::new(SequentialGate::new()),
			pool: Arc::downgrade(pool),
		})
	}

	/// Stable identity of this cell.
	pub fn id(&self) -> CellId {
		self.id
	}

	/// Current value, possibly intermediate. Deterministic and equal to the
	/// fixed-point value only at quiescence.
	pub fn get_result(&self) -> V {
		match &**self.state.load() {
			CellValue::Incomplete(v) | CellValue::Final(v) => v.clone(),
		}
	}

	/// `true` iff this cell has been finalized.
	pub fn is_complete(&self) -> bool {
		matches!(&**self.state.load(), CellValue::Final(_))
	}

	/// Requests the engine run this cell's `init` if it has not yet run.
	/// Idempotent: only the first call actually schedules `init`.
	///
	/// # Errors
	///
	/// [`EngineError::ShutdownInProgress`] if the pool has already shut
	/// down; `init` is left unrun and a later `trigger` after shutdown will
	/// keep failing the same way.
	pub fn trigger(self: &Arc<Self>) -> Result<()> {
		if self
			.tasks_active
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let Some(pool) = self.pool.upgrade() else {
				return Ok(());
			};
			let this = Arc::clone(self);
			let result = pool.try_spawn_counted(move || {
				let init = this.init.lock().take();
				if let Some(init) = init {
					trace!(cell = this.id.0, "invoking init");
					let outcome = init(&this);
					this.apply_own_outcome(outcome);
				}
			});
			if result.is_err() {
				// Allow a later `trigger` to retry once the pool is live again;
				// there is no live pool to retry against once shut down, but
				// this keeps the flag from permanently wedging a reused cell.
				self.tasks_active.store(false, Ordering::Release);
			}
			return result;
		}
		Ok(())
	}

	fn apply_own_outcome(self: &Arc<Self>, outcome: Outcome<V>) {
		match outcome {
			Outcome::Final(v) => {
				let _ = self.put_final(v);
			}
			Outcome::Next(v) => {
				let _ = self.put_next(v);
			}
			Outcome::None => {}
		}
	}

	/// Joins `v` into this cell's value without finalizing it.
	///
	/// # Errors
	///
	/// [`EngineError::AlreadyFinal`] if the cell is final and `v` would
	/// change the finalized value (unless the updater's `ignore_if_final`
	/// relaxes this). [`EngineError::NotMonotonic`] if the updater rejects
	/// the join.
	pub fn put_next(self: &Arc<Self>, v: V) -> Result<()> {
		self.join(v, false)
	}

	/// Joins `v` into this cell's value and transitions it to final.
	///
	/// # Errors
	///
	/// [`EngineError::AlreadyFinal`] if already final with a different
	/// value (unless `ignore_if_final` relaxes this).
	/// [`EngineError::NotMonotonic`] if the updater rejects the join.
	pub fn put_final(self: &Arc<Self>, v: V) -> Result<()> {
		self.join(v, true)
	}

	/// Forces finalization with `v`, bypassing the "no new final value after
	/// final" check. Acts only on non-final cells; a no-op if already final.
	/// Used by the pool's cycle/default resolution drivers.
	pub fn resolve_with_value(self: &Arc<Self>, v: V) -> Result<()> {
		if self.is_complete() {
			return Ok(());
		}
		self.join(v, true)
	}

	fn join(self: &Arc<Self>, incoming: V, finalize: bool) -> Result<()> {
		loop {
			let current = self.state.load();
			match &**current {
				CellValue::Final(existing) => {
					let joined = self.updater.update(existing, &incoming).map_err(|_| {
						warn!(cell = self.id.0, "join rejected: not monotonic against final value");
						EngineError::NotMonotonic
					})?;
					if &joined == existing {
						return Ok(());
					}
					return if self.updater.ignore_if_final() {
						Ok(())
					} else {
						debug!(cell = self.id.0, "join rejected: already final with a different value");
						Err(EngineError::AlreadyFinal)
					};
				}
				CellValue::Incomplete(res) => {
					let joined = self.updater.update(res, &incoming).map_err(|_| {
						warn!(cell = self.id.0, "join rejected: not monotonic");
						EngineError::NotMonotonic
					})?;
					if &joined == res && !finalize {
						return Ok(());
					}
					let new_state = Arc::new(if finalize {
						CellValue::Final(joined.clone())
					} else {
						CellValue::Incomplete(joined.clone())
					});
					let previous = self.state.compare_and_swap(&current, new_state);
					if !Arc::ptr_eq(&previous, &current) {
						continue;
					}
					self.on_advanced(&joined, finalize);
					return Ok(());
				}
			}
		}
	}

	fn on_advanced(self: &Arc<Self>, new_value: &V, finalized: bool) {
		trace!(cell = self.id.0, finalized, "cell advanced");
		let Some(pool) = self.pool.upgrade() else {
			return;
		};

		for entry in self.next_callbacks.iter() {
			for record in entry.value() {
				dispatch_next(&pool, record, new_value.clone(), finalized);
			}
		}

		if !finalized {
			return;
		}

		for entry in self.complete_callbacks.iter() {
			for record in entry.value() {
				dispatch_complete(&pool, record, new_value.clone());
			}
		}

		self.next_callbacks.clear();
		self.complete_callbacks.clear();

		for dep in self.next_deps.iter() {
			dep.next_callbacks.remove(&self.id);
			dep.complete_callbacks.remove(&self.id);
		}
		for dep in self.complete_deps.iter() {
			dep.next_callbacks.remove(&self.id);
			dep.complete_callbacks.remove(&self.id);
		}

		pool.cells_not_done.remove(&**self);
	}

	/// Registers `A.whenNext(B, cb)`: `cb` fires on every intermediate
	/// advance of `other`. If `other` is already final, this is ignored —
	/// there will be no further "next" advances to observe.
	pub fn when_next(self: &Arc<Self>, other: &Arc<Self>, cb: impl Fn(&V) -> Outcome<V> + Send + Sync + 'static) {
		self.register_next(other, Dispatch::Concurrent, move |v, _| cb(v));
	}

	/// Sequential-per-dependent variant of [`Cell::when_next`].
	pub fn when_next_sequential(
		self: &Arc<Self>,
		other: &Arc<Self>,
		cb: impl Fn(&V) -> Outcome<V> + Send + Sync + 'static,
	) {
		let gate = Arc::clone(&self.sequential_gate);
		self.register_next(other, Dispatch::Sequential(gate), move |v, _| cb(v));
	}

	/// Registers `A.whenComplete(B, cb)`: `cb` fires once, with `other`'s
	/// final value. If `other` is already final, `cb` is dispatched
	/// immediately and no dependency is installed.
	pub fn when_complete(self: &Arc<Self>, other: &Arc<Self>, cb: impl Fn(&V) -> Outcome<V> + Send + Sync + 'static) {
		self.register_complete(other, Dispatch::Concurrent, cb);
	}

	/// Sequential-per-dependent variant of [`Cell::when_complete`].
	pub fn when_complete_sequential(
		self: &Arc<Self>,
		other: &Arc<Self>,
		cb: impl Fn(&V) -> Outcome<V> + Send + Sync + 'static,
	) {
		let gate = Arc::clone(&self.sequential_gate);
		self.register_complete(other, Dispatch::Sequential(gate), cb);
	}

	/// Registers a combined `A.when(B, cb(v, isFinal))`: `cb` fires on every
	/// advance of `other`, with `isFinal` indicating whether that advance
	/// finalized `other`. `when` shares its `Next`-kind storage with
	/// [`Cell::when_next`]: if `other` is already final, registration is
	/// ignored — there is no further advance left to observe, so `cb` is
	/// never invoked for it.
	pub fn when(self: &Arc<Self>, other: &Arc<Self>, cb: impl Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static) {
		self.register_next(other, Dispatch::Concurrent, cb);
	}

	/// Sequential-per-dependent variant of [`Cell::when`].
	pub fn when_sequential(
		self: &Arc<Self>,
		other: &Arc<Self>,
		cb: impl Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static,
	) {
		let gate = Arc::clone(&self.sequential_gate);
		self.register_next(other, Dispatch::Sequential(gate), cb);
	}

	fn register_next(
		self: &Arc<Self>,
		other: &Arc<Self>,
		dispatch: Dispatch,
		cb: impl Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static,
	) {
		if other.is_complete() {
			// Next-kind registration on an already-final dependee is a no-op:
			// there will be no further advance to fire on, for both
			// `when_next` and `when`.
			return;
		}
		let newly = self.next_deps.insert(Arc::clone(other));
		if newly {
			let record = CallbackRecord {
				body: CallbackBody::Next(Arc::new(cb)),
				dispatch,
				dependent: Arc::downgrade(self),
			};
			other.next_callbacks.entry(self.id).or_default().push(record);
		}
		let _ = other.trigger();
	}

	fn register_complete(
		self: &Arc<Self>,
		other: &Arc<Self>,
		dispatch: Dispatch,
		cb: impl Fn(&V) -> Outcome<V> + Send + Sync + 'static,
	) {
		if other.is_complete() {
			let Some(pool) = self.pool.upgrade() else {
				return;
			};
			let record = CallbackRecord {
				body: CallbackBody::Complete(Arc::new(cb)),
				dispatch,
				dependent: Arc::downgrade(self),
			};
			let value = other.get_result();
			dispatch_complete(&pool, &record, value);
			return;
		}
		let newly = self.complete_deps.insert(Arc::clone(other));
		if newly {
			let record = CallbackRecord {
				body: CallbackBody::Complete(Arc::new(cb)),
				dispatch,
				dependent: Arc::downgrade(self),
			};
			other.complete_callbacks.entry(self.id).or_default().push(record);
		}
		let _ = other.trigger();
	}

	/// The current dependency set (next ∪ complete), used for SCC discovery.
	pub(crate) fn dependency_snapshot(&self) -> Vec<Arc<Cell<V, U>>> {
		let mut out: Vec<Arc<Cell<V, U>>> = self.next_deps.iter().map(|e| Arc::clone(&e)).collect();
		out.extend(self.complete_deps.iter().map(|e| Arc::clone(&e)));
		out
	}

	pub(crate) fn key(&self) -> Option<&Arc<dyn Key<V, U>>> {
		self.key.as_ref()
	}
}

fn dispatch_next<V, U>(pool: &Arc<HandlerPoolInner<V, U>>, record: &CallbackRecord<V, U>, value: V, is_final: bool)
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	let f = match &record.body {
		CallbackBody::Next(f) => Arc::clone(f),
		CallbackBody::Complete(_) => return,
	};
	let dependent = record.dependent.clone();
	let task: Box<dyn FnOnce() + Send> = Box::new(move || {
		let Some(dependent) = dependent.upgrade() else {
			return;
		};
		trace!(cell = dependent.id.0, is_final, "dispatching next callback");
		match f(&value, is_final) {
			Outcome::Final(v) => {
				let _ = dependent.put_final(v);
			}
			Outcome::Next(v) => {
				let _ = dependent.put_next(v);
			}
			Outcome::None => {}
		}
	});
	match &record.dispatch {
		Dispatch::Concurrent => pool.spawn_counted(task),
		Dispatch::Sequential(gate) => gate.submit(pool, task),
	}
}

fn dispatch_complete<V, U>(pool: &Arc<HandlerPoolInner<V, U>>, record: &CallbackRecord<V, U>, value: V)
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	let f = match &record.body {
		CallbackBody::Complete(f) => Arc::clone(f),
		CallbackBody::Next(_) => return,
	};
	let dependent = record.dependent.clone();
	let task: Box<dyn FnOnce() + Send> = Box::new(move || {
		let Some(dependent) = dependent.upgrade() else {
			return;
		};
		trace!(cell = dependent.id.0, "dispatching complete callback");
		match f(&value) {
			Outcome::Final(v) => {
				let _ = dependent.put_final(v);
			}
			Outcome::Next(v) => {
				let _ = dependent.put_next(v);
			}
			Outcome::None => {}
		}
	});
	match &record.dispatch {
		Dispatch::Concurrent => pool.spawn_counted(task),
		Dispatch::Sequential(gate) => gate.submit(pool, task),
	}
}
