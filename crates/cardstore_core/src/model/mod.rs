//! Card-centric data model.
//!
//! # Responsibility
//! - Define the universal `Card` record and its fixed column set.
//! - Define the `link` projection used by graph traversal.
//!
//! # Invariants
//! - Every card is identified by a stable `CardId`.
//! - Deletion is represented by `active=false`, never by row removal.

pub mod card;
pub mod link;
