//! runwatch -- live execution timelines for browser test runs and model runs.
//!
//! Push messages and polled history describe the same execution and overlap.
//! This crate folds both into one ordered, de-duplicated timeline per
//! execution ([`timeline::TimelineStore`]), keeps it current while the
//! execution is active ([`channel::RunChannel`]), and manages several
//! executions side by side ([`coordinator::MultiRunCoordinator`]).

pub mod backend;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod execution;
pub mod normalizer;
pub mod timeline;
