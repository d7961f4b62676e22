//! Ergonomic layer over [`fixpoint_runtime`]: common lattices, common
//! cycle-resolution policies, and the runtime's public contracts re-exported
//! under one name.

pub mod keys;
pub mod lattices;

pub use fixpoint_runtime::{
	CallbackFailure, Cell, CellId, EngineError, HandlerPool, Key, NotMonotonic, Outcome, PoolConfig, Result, Updater,
	DEFAULT_PASS_TIMEOUT,
};
