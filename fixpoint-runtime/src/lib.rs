//! Concurrent, deterministic fixed-point computation over user-defined
//! lattices.
//!
//! A [`HandlerPool`] owns a set of [`Cell`]s that each hold a monotonically
//! growing value. Cells register callbacks on one another (`when_next`,
//! `when_complete`, `when`); the pool drives callback dispatch across worker
//! threads until the graph reaches quiescence, then resolves any remaining
//! closed cycles through each cell's [`Key`] policy.

mod callback;
mod cell;
mod error;
mod key;
mod lattice;
mod outcome;
mod pool;
mod scc;

pub use cell::{Cell, CellId};
pub use error::{EngineError, Result};
pub use key::Key;
pub use lattice::{NotMonotonic, Updater};
pub use outcome::Outcome;
pub use pool::{CallbackFailure, HandlerPool, PoolConfig, DEFAULT_PASS_TIMEOUT};
pub use scc::closed_sccs;
