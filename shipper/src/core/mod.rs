//! Deterministic, pure logic shared by negotiation and the protocol executor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod adapter;
pub mod complexity;
pub mod constraints;
pub mod dodge;
pub mod history;
pub mod protocol;
pub mod retry;
pub mod signature;
pub mod types;
pub mod validation;
pub mod version;
