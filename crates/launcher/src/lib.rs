//! Peer-to-peer content provisioning and self-update for the desktop launcher.
//!
//! [`registry::TransferRegistry`] owns every live transfer,
//! [`persistence`] brings them back after a restart, and
//! [`update::UpdateOrchestrator`] drives the self-update through the same
//! registry before handing the file swap to a detached helper.

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod persistence;
pub mod registry;
pub mod release;
pub mod service;
pub mod update;

pub use error::{DlcError, Result};
