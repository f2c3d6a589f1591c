//! Backup/restore orchestration engine for MongoDB deployments.
//!
//! This crate owns the four hard subsystems: topology-aware source selection
//! ([`selector`]), the resumable backup strategy state machine
//! ([`strategy`]), the quiescence protocol ([`quiescence`]), and the error
//! taxonomy's retry discipline (re-exported from `mbs-errors`). Everything
//! this engine needs from the outside world — persistence, process/IO
//! execution, cloud upload, notification — is a trait in [`assistant`],
//! injected through [`context::MbsContext`].

pub mod assistant;
pub mod config;
pub mod connector;
pub mod context;
pub mod event;
pub mod naming;
pub mod quiescence;
pub mod restore;
pub mod retry;
pub mod selector;
pub mod source;
pub mod strategy;
pub mod task;

#[cfg(any(test, feature = "test"))]
pub mod test_support;

pub use mbs_errors::{MbsError, Retriable};

pub type Result<T> = std::result::Result<T, MbsError>;
