//! The handler pool: a work-stealing executor over a fixed `(V, U)` pair,
//! tracking outstanding work so callers can block until quiescence and then
//! drive cycle resolution.

use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Condvar, Mutex,
	},
	time::{Duration, Instant},
};

use dashmap::DashSet;
use tracing::{debug, trace, warn};

use crate::{
	cell::Cell,
	error::{EngineError, Result},
	key::Key,
	lattice::Updater,
	scc::closed_sccs,
};

/// Default per-pass timeout for the `while_quiescent_resolve_*` loops.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Tuning knobs for a [`HandlerPool`]. There is no file or environment
/// surface for this; callers construct it in code.
#[derive(Debug, Clone)]
pub struct PoolConfig {
	/// Number of worker threads. `None` lets rayon pick (typically the
	/// number of logical CPUs).
	pub num_threads: Option<usize>,
	/// Thread name prefix, for diagnostics.
	pub thread_name_prefix: String,
	/// How long a single quiescence wait inside
	/// [`HandlerPool::while_quiescent_resolve_cell`] /
	/// [`HandlerPool::while_quiescent_resolve_default`] may take before the
	/// loop gives up and leaves remaining cells in their current state.
	pub pass_timeout: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			num_threads: None,
			thread_name_prefix: "fixpoint-worker".to_string(),
			pass_timeout: DEFAULT_PASS_TIMEOUT,
		}
	}
}

/// Reported to the unhandled-exception handler when a user callback or init
/// closure panics inside a pool worker.
#[derive(Debug)]
pub struct CallbackFailure {
	/// The panic payload, downcast to a string where possible.
	pub message: String,
}

pub(crate) struct HandlerPoolInner<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> {
	pub(crate) rayon_pool: rayon::ThreadPool,
	pub(crate) updater: Arc<U>,
	pub(crate) cells_not_done: DashSet<Arc<Cell<V, U>>>,
	active_tasks: AtomicUsize,
	quiescence: Mutex<()>,
	quiescence_cv: Condvar,
	quiescent_handlers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
	unhandled_exception_handler: Option<Arc<dyn Fn(CallbackFailure) + Send + Sync>>,
	shutdown: AtomicBool,
	pass_timeout: Duration,
}

impl<V, U> HandlerPoolInner<V, U>
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	/// Schedules `task` on the pool, tracking it for quiescence detection.
	///
	/// # Errors
	///
	/// [`EngineError::ShutdownInProgress`] if the pool has been shut down;
	/// the task is not run.
	pub(crate) fn try_spawn_counted(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) -> Result<()> {
		if self.shutdown.load(Ordering::Acquire) {
			return Err(EngineError::ShutdownInProgress);
		}
		self.spawn_counted(task);
		Ok(())
	}

	/// Schedules `task` unconditionally. Used internally for work already
	/// admitted before shutdown (e.g. continuing a callback chain).
	pub(crate) fn spawn_counted(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
		self.active_tasks.fetch_add(1, Ordering::AcqRel);
		let this = Arc::clone(self);
		self.rayon_pool.spawn(move || {
			let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
			if let Err(payload) = result {
				let message = panic_message(payload);
				warn!(message, "callback panicked");
				if let Some(handler) = &this.unhandled_exception_handler {
					handler(CallbackFailure { message });
				}
			}
			if this.active_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
				// Drain and re-submit quiescence handlers as fresh tasks before
				// announcing quiescence: a handler that itself submits work
				// must be counted, and later `on_quiescent` registrations must
				// see that work rather than racing a stale "quiescent" signal.
				let drained: Vec<Box<dyn FnOnce() + Send>> = {
					let _guard = this.quiescence.lock().unwrap_or_else(|e| e.into_inner());
					let mut handlers = this.quiescent_handlers.lock().unwrap_or_else(|e| e.into_inner());
					std::mem::take(&mut *handlers)
				};
				if drained.is_empty() {
					let _guard = this.quiescence.lock().unwrap_or_else(|e| e.into_inner());
					trace!("pool quiescent");
					this.quiescence_cv.notify_all();
				} else {
					for handler in drained {
						this.spawn_counted(handler);
					}
				}
			}
		});
	}
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

/// A work-stealing pool of cells sharing one `(V, U)` lattice pair.
///
/// All cells created by a given pool use the same [`Updater`] instance; only
/// each cell's [`Key`] varies. This mirrors the common case where a single
/// computation has one notion of "how values join" but many distinct
/// resolution policies depending on where a cell sits in the dependency
/// graph.
pub struct HandlerPool<V: Clone + PartialEq + Send + Sync + 'static, U: Updater<Value = V>> {
	inner: Arc<HandlerPoolInner<V, U>>,
}

impl<V, U> Clone for HandlerPool<V, U>
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<V, U> HandlerPool<V, U>
where
	V: Clone + PartialEq + Send + Sync + 'static,
	U: Updater<Value = V>,
{
	/// Builds a new pool with the given configuration, updater, and an
	/// optional handler invoked whenever a user callback or init closure
	/// panics.
	pub fn new(
		config: PoolConfig,
		updater: U,
		unhandled_exception_handler: Option<Arc<dyn Fn(CallbackFailure) + Send + Sync>>,
	) -> Self {
		let mut builder = rayon::ThreadPoolBuilder::new().thread_name({
			let prefix = config.thread_name_prefix.clone();
			move |i| format!("{prefix}-{i}")
		});
		if let Some(n) = config.num_threads {
			builder = builder.num_threads(n);
		}
		let rayon_pool = builder.build().expect("failed to build worker pool");
		Self {
			inner: Arc::new(HandlerPoolInner {
				rayon_pool,
				updater: Arc::new(updater),
				cells_not_done: DashSet::new(),
				active_tasks: AtomicUsize::new(0),
				quiescence: Mutex::new(()),
				quiescence_cv: Condvar::new(),
				quiescent_handlers: Mutex::new(Vec::new()),
				unhandled_exception_handler,
				shutdown: AtomicBool::new(false),
				pass_timeout: config.pass_timeout,
			}),
		}
	}

	/// Creates a new, incomplete cell with `init` scheduled lazily (on first
	/// [`Cell::trigger`], typically via a dependency registration).
	pub fn create_cell(
		&self,
		key: Arc<dyn Key<V, U>>,
		init: impl FnOnce(&Arc<Cell<V, U>>) -> crate::outcome::Outcome<V> + Send + 'static,
	) -> Arc<Cell<V, U>> {
		let updater = Arc::clone(&self.inner.updater);
		let cell = Cell::new_incomplete(&self.inner, updater, key, Box::new(init));
		debug!(cell = ?cell.id(), "cell registered with pool");
		self.inner.cells_not_done.insert(Arc::clone(&cell));
		cell
	}

	/// Creates a cell that is final from the moment it is created, with no
	/// resolution policy of its own.
	pub fn create_completed_cell(&self, value: V) -> Arc<Cell<V, U>> {
		let updater = Arc::clone(&self.inner.updater);
		Cell::new_completed(&self.inner, updater, value)
	}

	/// Pool-level sugar for [`Cell::trigger`]: ensures `cell`'s `init` has
	/// been scheduled at most once. Dependency registration already calls
	/// this internally; exposed here so callers can kick off a computation
	/// without registering a dependency on it first.
	pub fn trigger_execution(&self, cell: &Arc<Cell<V, U>>) -> Result<()> {
		cell.trigger()
	}

	/// Registers `handler` to run exactly once, as a pool task, the next
	/// time the pool has zero tasks in flight. If the pool is already
	/// quiescent, `handler` is dispatched immediately (as a fresh task).
	pub fn on_quiescent(&self, handler: impl FnOnce() + Send + 'static) {
		let boxed: Box<dyn FnOnce() + Send> = Box::new(handler);
		let guard = self.inner.quiescence.lock().unwrap_or_else(|e| e.into_inner());
		if self.inner.active_tasks.load(Ordering::Acquire) == 0 {
			drop(guard);
			trace!("on_quiescent: pool already quiescent, dispatching immediately");
			self.inner.spawn_counted(boxed);
		} else {
			self.inner
				.quiescent_handlers
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.push(boxed);
			drop(guard);
		}
	}

	/// Blocks the calling thread until no worker task is outstanding, then
	/// returns every cell that is not yet final.
	///
	/// This is quiescence in the sense of the engine's own work queue, not
	/// necessarily a global fixed point: cells may remain incomplete because
	/// they form unresolved cycles, or because nothing ever triggered them.
	pub fn quiescent_incomplete_cells(&self) -> Vec<Arc<Cell<V, U>>> {
		self.wait_for_quiescence();
		self.snapshot_incomplete()
	}

	/// Drives the engine to a full fixed point: repeatedly waits for
	/// quiescence, resolves any closed SCCs among the remaining incomplete
	/// cells via their [`Key::resolve`], waits again, and finally applies
	/// [`Key::fallback`] to whatever is still incomplete. Returns once no
	/// cell is left incomplete or no policy resolves any further cell.
	pub fn run_to_fixed_point(&self) {
		loop {
			let incomplete = self.quiescent_incomplete_cells();
			if incomplete.is_empty() {
				return;
			}

			let resolved_any = self.resolve_closed_sccs(&incomplete, None);
			if resolved_any {
				self.wait_for_quiescence();
				continue;
			}

			let fell_back = self.resolve_fallback(&incomplete);
			self.wait_for_quiescence();
			if !fell_back {
				debug!(remaining = incomplete.len(), "no policy resolved remaining cells");
				return;
			}
		}
	}

	/// Self-contained driver: at the next quiescence, finds closed SCCs
	/// among the non-final cells and resolves each via its head cell's
	/// [`Key::resolve`]. Returns the cells still incomplete afterward.
	pub fn quiescent_resolve_cycles(&self) -> Vec<Arc<Cell<V, U>>> {
		let incomplete = self.quiescent_incomplete_cells();
		self.resolve_closed_sccs(&incomplete, None);
		self.quiescent_incomplete_cells()
	}

	/// Self-contained driver: at the next quiescence, applies each
	/// remaining non-final cell's [`Key::fallback`] policy. Returns the
	/// cells still incomplete afterward.
	pub fn quiescent_resolve_defaults(&self) -> Vec<Arc<Cell<V, U>>> {
		let incomplete = self.quiescent_incomplete_cells();
		self.resolve_fallback(&incomplete);
		self.quiescent_incomplete_cells()
	}

	/// Self-contained driver targeting one cell: at the next quiescence,
	/// resolves `cell`'s closed SCC (if it has one) via its key's
	/// [`Key::resolve`], leaving every other closed SCC untouched. Returns
	/// `true` if `cell` is final afterward.
	pub fn quiescent_resolve_cell(&self, cell: &Arc<Cell<V, U>>) -> bool {
		if cell.is_complete() {
			return true;
		}
		let incomplete = self.quiescent_incomplete_cells();
		self.resolve_closed_sccs(&incomplete, Some(cell.id()));
		self.wait_for_quiescence();
		cell.is_complete()
	}

	/// Loops [`HandlerPool::quiescent_resolve_cell`] for `cell`, falling
	/// back to its own [`Key::fallback`] between attempts, until it is
	/// final or a pass does not quiesce within the configured
	/// [`PoolConfig::pass_timeout`]. Returns `true` if `cell` ended final.
	pub fn while_quiescent_resolve_cell(&self, cell: &Arc<Cell<V, U>>) -> bool {
		let deadline = Instant::now() + self.inner.pass_timeout;
		loop {
			if cell.is_complete() {
				return true;
			}
			if !self.wait_for_quiescence_timeout(deadline.saturating_duration_since(Instant::now())) {
				debug!(cell = ?cell.id(), "while_quiescent_resolve_cell: pass timed out");
				return false;
			}
			let incomplete = self.snapshot_incomplete();
			if !incomplete.iter().any(|c| c.id() == cell.id()) {
				return cell.is_complete();
			}
			let before = self.inner.cells_not_done.len();
			self.resolve_closed_sccs(&incomplete, Some(cell.id()));
			if !self.wait_for_quiescence_timeout(deadline.saturating_duration_since(Instant::now())) {
				return cell.is_complete();
			}
			if cell.is_complete() {
				return true;
			}
			if let Some(key) = cell.key() {
				for (target, value) in key.fallback(std::slice::from_ref(cell)) {
					let _ = target.resolve_with_value(value);
				}
			}
			if !self.wait_for_quiescence_timeout(deadline.saturating_duration_since(Instant::now())) {
				return cell.is_complete();
			}
			if cell.is_complete() {
				return true;
			}
			if self.inner.cells_not_done.len() >= before {
				// Neither cycle resolution nor this cell's own fallback made
				// progress; nothing will change on another identical pass.
				return false;
			}
		}
	}

	/// Loops cycle resolution then fallback resolution across the whole
	/// pool until no non-final cells remain, or a pass does not quiesce
	/// within the configured [`PoolConfig::pass_timeout`]. Returns the
	/// cells still incomplete when the loop stops.
	pub fn while_quiescent_resolve_default(&self) -> Vec<Arc<Cell<V, U>>> {
		let deadline = Instant::now() + self.inner.pass_timeout;
		loop {
			if !self.wait_for_quiescence_timeout(deadline.saturating_duration_since(Instant::now())) {
				debug!("while_quiescent_resolve_default: pass timed out");
				return self.snapshot_incomplete();
			}
			let incomplete = self.snapshot_incomplete();
			if incomplete.is_empty() {
				return incomplete;
			}
			let before = incomplete.len();
			let resolved_cycles = self.resolve_closed_sccs(&incomplete, None);
			if !resolved_cycles {
				self.resolve_fallback(&incomplete);
			}
			if !self.wait_for_quiescence_timeout(deadline.saturating_duration_since(Instant::now())) {
				return self.snapshot_incomplete();
			}
			let after = self.inner.cells_not_done.len();
			if after == 0 || after >= before {
				return self.snapshot_incomplete();
			}
		}
	}

	/// Finds closed SCCs among `incomplete` and resolves each via its head
	/// cell's [`Key::resolve`]. If `only` is set, resolves just the one
	/// closed SCC containing that cell, if any. Returns `true` if any cell
	/// was resolved.
	fn resolve_closed_sccs(&self, incomplete: &[Arc<Cell<V, U>>], only: Option<crate::cell::CellId>) -> bool {
		let components = closed_sccs(incomplete, |cell| cell.dependency_snapshot());
		let mut resolved_any = false;
		for component in &components {
			if let Some(target) = only {
				if !component.iter().any(|c| c.id() == target) {
					continue;
				}
			}
			let Some(head) = component.first() else { continue };
			let Some(key) = head.key() else { continue };
			trace!(scc_size = component.len(), "resolving closed scc via key.resolve");
			let resolutions = key.resolve(component);
			for (cell, value) in resolutions {
				if cell.resolve_with_value(value).is_ok() {
					resolved_any = true;
				}
			}
			if only.is_some() {
				break;
			}
		}
		resolved_any
	}

	/// Applies each remaining incomplete cell's [`Key::fallback`] policy.
	/// Returns `true` if any cell was resolved.
	fn resolve_fallback(&self, incomplete: &[Arc<Cell<V, U>>]) -> bool {
		let mut by_key_cells: Vec<Arc<Cell<V, U>>> = Vec::new();
		for cell in incomplete {
			if !cell.is_complete() {
				by_key_cells.push(Arc::clone(cell));
			}
		}
		if by_key_cells.is_empty() {
			return false;
		}
		let mut resolved_any = false;
		// Each cell may carry a distinct fallback policy; group trivially by
		// calling each cell's own key with the whole remaining set, letting
		// policies decide which members of `cells` they care about.
		let mut seen_policies: Vec<*const ()> = Vec::new();
		for cell in &by_key_cells {
			let Some(key) = cell.key() else { continue };
			let ptr = Arc::as_ptr(key) as *const ();
			if seen_policies.contains(&ptr) {
				continue;
			}
			seen_policies.push(ptr);
			trace!(candidates = by_key_cells.len(), "applying fallback policy");
			let resolutions = key.fallback(&by_key_cells);
			for (target, value) in resolutions {
				if target.resolve_with_value(value).is_ok() {
					resolved_any = true;
				}
			}
		}
		resolved_any
	}

	fn snapshot_incomplete(&self) -> Vec<Arc<Cell<V, U>>> {
		self.inner.cells_not_done.iter().map(|e| Arc::clone(&e)).collect()
	}

	fn wait_for_quiescence(&self) {
		trace!("waiting for quiescence");
		let mut guard = self.inner.quiescence.lock().unwrap_or_else(|e| e.into_inner());
		while self.inner.active_tasks.load(Ordering::Acquire) != 0 {
			guard = self
				.inner
				.quiescence_cv
				.wait(guard)
				.unwrap_or_else(|e| e.into_inner());
		}
	}

	/// Like [`HandlerPool::wait_for_quiescence`], but gives up after
	/// `timeout` and returns `false` instead of blocking indefinitely.
	fn wait_for_quiescence_timeout(&self, timeout: Duration) -> bool {
		let mut guard = self.inner.quiescence.lock().unwrap_or_else(|e| e.into_inner());
		let deadline = Instant::now() + timeout;
		loop {
			if self.inner.active_tasks.load(Ordering::Acquire) == 0 {
				return true;
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return false;
			}
			let (next_guard, result) = self
				.inner
				.quiescence_cv
				.wait_timeout(guard, remaining)
				.unwrap_or_else(|e| e.into_inner());
			guard = next_guard;
			if result.timed_out() && self.inner.active_tasks.load(Ordering::Acquire) != 0 {
				return false;
			}
		}
	}

	/// Number of cells created by this pool that are not yet final. Cheap
	/// snapshot, not synchronized with [`HandlerPool::quiescent_incomplete_cells`].
	pub fn cells_not_done_count(&self) -> usize {
		self.inner.cells_not_done.len()
	}

	/// Marks the pool as shutting down: every subsequent [`Cell::trigger`]
	/// and internally-scheduled task submission fails with
	/// [`crate::error::EngineError::ShutdownInProgress`] instead of running.
	/// Tasks already admitted continue to completion.
	pub fn shutdown(&self) {
		self.inner.shutdown.store(true, Ordering::Release);
	}

	/// `true` once [`HandlerPool::shutdown`] has been called.
	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.load(Ordering::Acquire)
	}
}
