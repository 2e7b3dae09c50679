//! Checkpointing and crash recovery.
//!
//! The checkpointer bounds how much log a restart must replay; the
//! controller turns whatever the log holds into a consistent store before
//! any transaction runs.

pub mod checkpoint;
pub mod controller;

pub use checkpoint::{CheckpointConfig, CheckpointManager};
pub use controller::{RecoveryController, RecoveryError, RecoveryReport};
