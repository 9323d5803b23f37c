//! xtalsearch: an evolutionary search engine for crystal-structure
//! prediction.
//!
//! The engine keeps a target number of candidate relaxations in flight
//! against an external optimizer (GULP locally, VASP through a pool of
//! remote-exec channels), detects symmetry-equivalent results, and breeds
//! new candidates from the optimized survivors until the operator halts
//! the session.

pub mod core;
pub mod engine;
pub mod error;
pub mod interface;
pub mod persist;
