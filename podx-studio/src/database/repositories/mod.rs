//! Repository layer for database access.

pub mod preset;
pub mod run;

pub use preset::*;
pub use run::*;
