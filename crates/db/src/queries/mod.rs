// crates/db/src/queries/mod.rs
//! Query modules: job rows and the progress event log.

pub mod events;
pub mod jobs;
