//! End-to-end scenarios driving a full pool: creation, propagation, cycle
//! resolution, fallback, and panic containment.

use std::sync::{
	atomic::{AtomicBool, AtomicUsize, Ordering},
	Arc, Mutex,
};

use fixpoint_runtime::{CallbackFailure, HandlerPool, Key, NotMonotonic, Outcome, PoolConfig, Updater};

/// The three-element purity lattice: bottom ⊏ pure ⊏ impure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Purity {
	Bottom,
	Pure,
	Impure,
}

struct PurityUpdater;

impl Updater for PurityUpdater {
	type Value = Purity;

	fn bottom(&self) -> Self::Value {
		Purity::Bottom
	}

	fn update(&self, current: &Self::Value, incoming: &Self::Value) -> Result<Self::Value, NotMonotonic> {
		Ok((*current).max(*incoming))
	}
}

struct AllPure;

impl Key<Purity, PurityUpdater> for AllPure {
	fn resolve(
		&self,
		cells: &[Arc<fixpoint_runtime::Cell<Purity, PurityUpdater>>],
	) -> Vec<(Arc<fixpoint_runtime::Cell<Purity, PurityUpdater>>, Purity)> {
		cells.iter().map(|c| (Arc::clone(c), Purity::Pure)).collect()
	}

	fn fallback(
		&self,
		cells: &[Arc<fixpoint_runtime::Cell<Purity, PurityUpdater>>],
	) -> Vec<(Arc<fixpoint_runtime::Cell<Purity, PurityUpdater>>, Purity)> {
		cells.iter().map(|c| (Arc::clone(c), Purity::Pure)).collect()
	}
}

fn pool() -> HandlerPool<Purity, PurityUpdater> {
	HandlerPool::new(PoolConfig::default(), PurityUpdater, None)
}

#[test]
fn scenario_1_next_then_final_keeps_the_larger_value() {
	let pool = pool();
	let c = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let _ = c.trigger();
	c.put_next(Purity::Pure).unwrap();
	c.put_final(Purity::Impure).unwrap();
	assert_eq!(c.get_result(), Purity::Impure);
	assert!(c.is_complete());
}

#[test]
fn scenario_2_when_complete_propagates_final_value() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	a.when_complete(&b, |v| Outcome::Final(*v));
	b.put_final(Purity::Impure).unwrap();
	pool.quiescent_incomplete_cells();
	assert_eq!(a.get_result(), Purity::Impure);
	assert!(a.is_complete());
}

#[test]
fn scenario_3_closed_cycle_resolves_via_key() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let c = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	a.when_next(&b, |v| Outcome::Next(*v));
	b.when_next(&c, |v| Outcome::Next(*v));
	c.when_next(&a, |v| Outcome::Next(*v));

	let incomplete = pool.quiescent_incomplete_cells();
	assert_eq!(incomplete.len(), 3);
	let remaining = pool.quiescent_resolve_cycles();
	assert!(remaining.is_empty());

	assert!(a.is_complete());
	assert!(b.is_complete());
	assert!(c.is_complete());
	assert_eq!(a.get_result(), Purity::Pure);
	assert_eq!(b.get_result(), Purity::Pure);
	assert_eq!(c.get_result(), Purity::Pure);
}

#[test]
fn scenario_4_untriggered_cell_resolves_via_fallback() {
	let pool = pool();
	let d = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	// `d` is never triggered.
	let incomplete = pool.quiescent_incomplete_cells();
	assert_eq!(incomplete.len(), 1);
	let remaining = pool.quiescent_resolve_defaults();
	assert!(remaining.is_empty());
	assert!(d.is_complete());
	assert_eq!(d.get_result(), Purity::Pure);
}

#[test]
fn scenario_5_panicking_callback_is_contained() {
	let seen = Arc::new(Mutex::new(Vec::<String>::new()));
	let seen2 = Arc::clone(&seen);
	let handler: Arc<dyn Fn(CallbackFailure) + Send + Sync> = Arc::new(move |f| {
		seen2.lock().unwrap().push(f.message);
	});
	let pool: HandlerPool<Purity, PurityUpdater> = HandlerPool::new(PoolConfig::default(), PurityUpdater, Some(handler));
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	a.when_next(&b, |_| -> Outcome<Purity> { panic!("boom") });
	b.put_next(Purity::Pure).unwrap();

	pool.quiescent_incomplete_cells();

	assert!(!a.is_complete());
	assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn scenario_6_monotonicity_violation_is_rejected() {
	struct OneWay;
	impl Updater for OneWay {
		type Value = Purity;
		fn bottom(&self) -> Self::Value {
			Purity::Bottom
		}
		fn update(&self, current: &Self::Value, incoming: &Self::Value) -> Result<Self::Value, NotMonotonic> {
			if *current == Purity::Impure && *incoming == Purity::Pure {
				return Err(NotMonotonic);
			}
			Ok((*current).max(*incoming))
		}
	}

	let pool: HandlerPool<Purity, OneWay> = HandlerPool::new(PoolConfig::default(), OneWay, None);
	struct NoopKey;
	impl Key<Purity, OneWay> for NoopKey {
		fn resolve(&self, _: &[Arc<fixpoint_runtime::Cell<Purity, OneWay>>]) -> Vec<(Arc<fixpoint_runtime::Cell<Purity, OneWay>>, Purity)> {
			Vec::new()
		}
		fn fallback(&self, _: &[Arc<fixpoint_runtime::Cell<Purity, OneWay>>]) -> Vec<(Arc<fixpoint_runtime::Cell<Purity, OneWay>>, Purity)> {
			Vec::new()
		}
	}
	let a = pool.create_cell(Arc::new(NoopKey), |_| Outcome::None);
	let _ = a.trigger();
	a.put_final(Purity::Impure).unwrap();
	assert!(a.put_next(Purity::Pure).is_err());
	assert_eq!(a.get_result(), Purity::Impure);
}

#[test]
fn fold_of_updates_is_order_independent() {
	let pool1 = pool();
	let a = pool1.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let _ = a.trigger();
	a.put_next(Purity::Pure).unwrap();
	a.put_next(Purity::Bottom).unwrap();
	a.put_next(Purity::Pure).unwrap();
	assert_eq!(a.get_result(), Purity::Pure);

	let pool2 = pool();
	let b = pool2.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let _ = b.trigger();
	b.put_next(Purity::Bottom).unwrap();
	b.put_next(Purity::Pure).unwrap();
	b.put_next(Purity::Bottom).unwrap();
	assert_eq!(b.get_result(), b.get_result().max(Purity::Pure));
}

#[test]
fn already_final_rejects_non_matching_value() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let _ = a.trigger();
	a.put_final(Purity::Pure).unwrap();
	assert_eq!(a.get_result(), Purity::Pure);
	// Any join that would change an already-final value is rejected, even one
	// that moves upward in the lattice.
	assert!(a.put_next(Purity::Impure).is_err());
	assert_eq!(a.get_result(), Purity::Pure);
}

#[test]
fn self_loop_is_a_closed_singleton() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let a2 = Arc::clone(&a);
	a.when_next(&a2, |v| Outcome::Next(*v));

	let incomplete = pool.quiescent_incomplete_cells();
	assert_eq!(incomplete.len(), 1);
	let remaining = pool.quiescent_resolve_cycles();
	assert!(remaining.is_empty());
	assert!(a.is_complete());
}

#[test]
fn fan_in_all_dependents_advance_together() {
	let pool = pool();
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let counter = Arc::new(AtomicUsize::new(0));
	let dependents: Vec<_> = (0..8)
		.map(|_| {
			let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
			let counter = Arc::clone(&counter);
			a.when_next(&b, move |v| {
				counter.fetch_add(1, Ordering::SeqCst);
				Outcome::Next(*v)
			});
			a
		})
		.collect();

	let _ = b.trigger();
	b.put_next(Purity::Pure).unwrap();
	pool.quiescent_incomplete_cells();

	assert_eq!(counter.load(Ordering::SeqCst), 8);
	for a in dependents {
		assert_eq!(a.get_result(), Purity::Pure);
	}
}

#[test]
fn completed_cell_reads_back_exactly_its_value() {
	let pool = pool();
	let c = pool.create_completed_cell(Purity::Pure);
	assert!(c.is_complete());
	assert_eq!(c.get_result(), Purity::Pure);
}

#[test]
fn registering_the_same_when_next_twice_behaves_like_once() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let count = Arc::new(AtomicUsize::new(0));
	let make_cb = || {
		let count = Arc::clone(&count);
		move |v: &Purity| {
			count.fetch_add(1, Ordering::SeqCst);
			Outcome::Next(*v)
		}
	};
	a.when_next(&b, make_cb());
	a.when_next(&b, make_cb());

	let _ = b.trigger();
	b.put_next(Purity::Pure).unwrap();
	pool.quiescent_incomplete_cells();

	assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn quiescence_matches_incomplete_cell_set() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::Final(Purity::Pure));
	let _ = a.trigger();
	let _ = b.trigger();

	let incomplete = pool.quiescent_incomplete_cells();
	assert_eq!(incomplete.len(), 1);
	assert_eq!(incomplete[0].id(), a.id());
}

#[test]
fn sequential_dispatch_never_overlaps_for_one_dependent() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let busy = Arc::new(AtomicBool::new(false));
	let violated = Arc::new(AtomicBool::new(false));

	let sources: Vec<_> = (0..16)
		.map(|_| {
			let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
			let busy = Arc::clone(&busy);
			let violated = Arc::clone(&violated);
			a.when_next_sequential(&b, move |_| {
				if busy.swap(true, Ordering::SeqCst) {
					violated.store(true, Ordering::SeqCst);
				}
				std::thread::yield_now();
				busy.store(false, Ordering::SeqCst);
				Outcome::None
			});
			b
		})
		.collect();

	for b in &sources {
		let _ = b.trigger();
		b.put_next(Purity::Pure).unwrap();
	}
	pool.quiescent_incomplete_cells();

	assert!(!violated.load(Ordering::SeqCst));
}

#[test]
fn when_on_an_already_final_dependee_is_ignored_not_dispatched() {
	let pool = pool();
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	b.put_final(Purity::Impure).unwrap();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let fired = Arc::new(AtomicBool::new(false));
	let fired2 = Arc::clone(&fired);
	a.when(&b, move |v, is_final| {
		fired2.store(true, Ordering::SeqCst);
		if is_final {
			Outcome::Final(*v)
		} else {
			Outcome::Next(*v)
		}
	});
	pool.quiescent_incomplete_cells();
	assert!(!fired.load(Ordering::SeqCst));
	assert!(!a.is_complete());
}

#[test]
fn trigger_execution_runs_init_exactly_once() {
	let pool = pool();
	let runs = Arc::new(AtomicUsize::new(0));
	let runs2 = Arc::clone(&runs);
	let a = pool.create_cell(Arc::new(AllPure), move |_| {
		runs2.fetch_add(1, Ordering::SeqCst);
		Outcome::Final(Purity::Pure)
	});
	pool.trigger_execution(&a).unwrap();
	pool.trigger_execution(&a).unwrap();
	pool.quiescent_incomplete_cells();
	assert_eq!(runs.load(Ordering::SeqCst), 1);
	assert_eq!(a.get_result(), Purity::Pure);
}

#[test]
fn on_quiescent_fires_immediately_when_already_quiescent() {
	let pool = pool();
	let fired = Arc::new(AtomicBool::new(false));
	let fired2 = Arc::clone(&fired);
	pool.on_quiescent(move || fired2.store(true, Ordering::SeqCst));
	pool.quiescent_incomplete_cells();
	assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn on_quiescent_fires_once_after_outstanding_work_drains() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::Final(Purity::Pure));
	let _ = a.trigger();
	let fired = Arc::new(AtomicUsize::new(0));
	let fired2 = Arc::clone(&fired);
	pool.on_quiescent(move || {
		fired2.fetch_add(1, Ordering::SeqCst);
	});
	pool.quiescent_incomplete_cells();
	assert_eq!(fired.load(Ordering::SeqCst), 1);
	assert!(a.is_complete());
}

#[test]
fn quiescent_resolve_cell_targets_only_the_given_cells_cycle() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let c = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let d = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	a.when_next(&b, |v| Outcome::Next(*v));
	b.when_next(&a, |v| Outcome::Next(*v));
	// `c`/`d` form an independent closed cycle that should be left alone.
	c.when_next(&d, |v| Outcome::Next(*v));
	d.when_next(&c, |v| Outcome::Next(*v));

	let resolved = pool.quiescent_resolve_cell(&a);
	assert!(resolved);
	assert!(a.is_complete());
	assert!(b.is_complete());
	assert!(!c.is_complete());
	assert!(!d.is_complete());
}

#[test]
fn while_quiescent_resolve_cell_finalizes_an_untriggered_orphan() {
	let pool = pool();
	let d = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	// `d` is never triggered and has no dependency edges, so it is a
	// trivially closed singleton SCC.
	assert!(pool.while_quiescent_resolve_cell(&d));
	assert!(d.is_complete());
	assert_eq!(d.get_result(), Purity::Pure);
}

#[test]
fn while_quiescent_resolve_default_drives_every_cell_to_final() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	let b = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	a.when_next(&b, |v| Outcome::Next(*v));
	b.when_next(&a, |v| Outcome::Next(*v));
	let remaining = pool.while_quiescent_resolve_default();
	assert!(remaining.is_empty());
	assert!(a.is_complete());
	assert!(b.is_complete());
}

#[test]
fn pool_config_pass_timeout_defaults_to_fifteen_minutes() {
	let config = PoolConfig::default();
	assert_eq!(config.pass_timeout, std::time::Duration::from_secs(15 * 60));
}

#[test]
fn trigger_after_shutdown_is_rejected() {
	let pool = pool();
	let a = pool.create_cell(Arc::new(AllPure), |_| Outcome::None);
	pool.shutdown();
	assert!(pool.is_shutdown());
	assert!(a.trigger().is_err());
	assert!(!a.is_complete());
}
