//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the storage contract the kernel orchestrates.
//! - Isolate SQLite query details from permission and validation logic.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`Conflict`, `InvalidData`) in
//!   addition to DB transport errors.

pub mod card_repo;
