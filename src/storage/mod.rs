//! Storage helpers for finguard
//!
//! Atomic JSON file persistence used by the local key provider and the key
//! backup vault. Record persistence is the caller's concern: mapper output
//! is plain JSON.

pub mod file_io;

pub use file_io::{read_json, write_json_atomic};
