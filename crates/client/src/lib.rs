// crates/client/src/lib.rs
//! Client-side reconciliation for jobstream progress streams.
//!
//! The server guarantees at-least-once delivery across two overlapping
//! sources (live WebSocket, history replay); this crate provides the
//! idempotent client-side merge that turns them into one consistent view,
//! plus a ready-made follower loop with reconnect and catch-up.

pub mod follower;
pub mod reconciler;
pub mod reconnect;

pub use follower::{ConnectionPhase, FollowError, JobFollower};
pub use reconciler::{JobView, Reconciler};
pub use reconnect::Backoff;
