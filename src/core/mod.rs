pub mod candidate;
pub mod cell;
pub mod composition;
pub mod config;
pub mod symmetry;
