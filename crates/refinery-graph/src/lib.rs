//! Refinery graph core
//!
//! Turns one validated fact message into one parameterized graph-mutation
//! program:
//!
//! ```text
//! message ──► resolver (field ownership vs. source priority)
//!        └──► date pass (ISO-8601 strings become typed date sets)
//!        └──► compiler ──► MutationProgram (tagged ops + params)
//!                               └──► rendered to Cypher by wire backends,
//!                                    interpreted directly by the in-memory
//!                                    store
//! ```
//!
//! The program always emits the primary entity's operations before any
//! connection's, so relationships can reference an already-merged primary
//! node inside the same transaction.

pub mod compiler;
pub mod cypher;
pub mod dates;
pub mod resolver;

pub use compiler::{compile, CompileError, CompilerOptions};
pub use cypher::{KeyedParam, MutationOp, MutationProgram, PRIMARY_ALIAS};
pub use resolver::{resolve, Resolution, ResolvedOwnership};
