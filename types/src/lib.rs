//! Plain data shared by the fork choice crates.
//!
//! Everything here is produced by collaborators that have already validated it.
//! Fork choice never re-checks signatures or state transitions.

pub mod consts;
pub mod containers;
pub mod primitives;
