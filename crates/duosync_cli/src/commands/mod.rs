//! CLI command implementations.

pub mod demo;
pub mod ids;
pub mod inspect;
pub mod offer;
