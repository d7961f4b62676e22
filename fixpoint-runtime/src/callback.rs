//! Callback runnables: small closure bundles around user callbacks, with two
//! dispatch disciplines — concurrent (no ordering) and sequential-per-dependent
//! (serialized per dependent cell, submission order preserved).

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Weak,
};

use crossbeam_queue::SegQueue;

use crate::{cell::Cell, lattice::Updater, outcome::Outcome, pool::HandlerPoolInner};

/// The body of a registered callback.
///
/// `Next` fires on every successful advance of the dependee, including the
/// advance that finalizes it (in which case `is_final` is `true`).
/// `Complete` fires only once, when the dependee finalizes.
pub(crate) enum CallbackBody<V> {
	Next(Arc<dyn Fn(&V, bool) -> Outcome<V> + Send + Sync>),
	Complete(Arc<dyn Fn(&V) -> Outcome<V> + Send + Sync>),
}

impl<V> Clone for CallbackBody<V> {
	fn clone(&self) -> Self {
		match self {
			CallbackBody::Next(f) => CallbackBody::Next(Arc::clone(f)),
			CallbackBody::Complete(f) => CallbackBody::Complete(Arc::clone(f)),
		}
	}
}

/// How a callback body is scheduled relative to other callbacks on the same
/// dependent cell.
#[derive(Clone)]
pub(crate) enum Dispatch {
	/// No ordering guarantee; may run on any worker, interleaved with other
	/// concurrent callbacks.
	Concurrent,
	/// Serialized per dependent cell: at most one body guarded by a given
	/// [`SequentialGate`] runs at a time, in submission order.
	Sequential(Arc<SequentialGate>),
}

/// A registered callback, bound (weakly) to the dependent cell it was
/// registered for. The weak back-edge lets a finalized dependent be dropped
/// even while a dependee still holds stale callback records for it;
/// finalization eagerly drains those records anyway (see
/// [`Cell`](crate::cell::Cell)'s finalization algorithm), so the weak edge
/// is mostly a defense against ordering surprises during teardown.
pub(crate) struct CallbackRecord<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> {
	pub(crate) body: CallbackBody<V>,
	pub(crate) dispatch: Dispatch,
	pub(crate) dependent: Weak<Cell<V, U>>,
}

impl<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> Clone for CallbackRecord<V, U> {
	fn clone(&self) -> Self {
		Self {
			body: self.body.clone(),
			dispatch: self.dispatch.clone(),
			dependent: self.dependent.clone(),
		}
	}
}

/// Per-dependent-cell serialization token.
///
/// A callback wishing to run acquires the gate by flipping `busy` from
/// `false` to `true`; on contention it instead enqueues its task. Whoever
/// holds the gate drains the queue before releasing it, then re-checks for
/// a race where an item was pushed just as the queue looked empty. This
/// bounds stack depth by always resubmitting continuations as fresh pool
/// tasks rather than recursing.
pub(crate) struct SequentialGate {
	busy: AtomicBool,
	queue: SegQueue<Box<dyn FnOnce() + Send>>,
}

impl SequentialGate {
	pub(crate) fn new() -> Self {
		Self {
			busy: AtomicBool::new(false),
			queue: SegQueue::new(),
		}
	}

	/// Submits `task` to run exclusively for this gate, via `pool`.
	pub(crate) fn submit<V, U>(self: &Arc<Self>, pool: &Arc<HandlerPoolInner<V, U>>, task: Box<dyn FnOnce() + Send>)
	where
		V: Clone + PartialEq + Send + Sync + 'static,
		U: Updater<Value = V>,
	{
		self.queue.push(task);
		self.try_drain(pool);
	}

	fn try_drain<V, U>(self: &Arc<Self>, pool: &Arc<HandlerPoolInner<V, U>>)
	where
		V: Clone + PartialEq + Send + Sync + 'static,
		U: Updater<Value = V>,
	{
		if self
			.busy
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let this = Arc::clone(self);
			let pool2 = Arc::clone(pool);
			pool.spawn_counted(move || this.run_loop(&pool2));
		}
	}

	fn run_loop<V, U>(self: Arc<Self>, pool: &Arc<HandlerPoolInner<V, U>>)
	where
		V: Clone + PartialEq + Send + Sync + 'static,
		U: Updater<Value = V>,
	{
		while let Some(task) = self.queue.pop() {
			task();
		}
		self.busy.store(false, Ordering::Release);
		// A task may have been pushed between our last `pop` returning `None`
		// and clearing `busy`; re-check and re-claim if so.
		if !self.queue.is_empty() {
			self.try_drain(pool);
		}
	}
}
