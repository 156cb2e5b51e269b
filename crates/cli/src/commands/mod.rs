//! CLI Commands

pub mod snapshot;
pub mod validate;
