//! storysnap CLI
//!
//! Command-line interface that discovers stories from a Storybook catalog
//! and uploads their snapshots to the visual-diffing service.

pub mod client;
pub mod commands;
pub mod output;
