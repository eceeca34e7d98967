//! Negotiated, constraint-gated release protocol for instruction TODOs.
//!
//! A TODO's instruction is negotiated with an external completion service into
//! a bounded task list, checked against an immutable rule set, applied to the
//! work tree and published through a fixed 13-step protocol. The crate keeps a
//! strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (constraints, validation,
//!   signatures, retry state, the protocol state machine). No I/O.
//! - **[`io`]**: Side-effecting collaborators (filesystem state, git,
//!   completion processes). Behind traits so tests can script them.
//!
//! Orchestration modules ([`negotiator`], [`protocol`]) coordinate the two to
//! implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod negotiator;
pub mod protocol;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
