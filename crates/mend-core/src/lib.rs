//! Core model and policies for the mend self-healing loop.
//!
//! Everything here is synchronous and free of I/O apart from config and
//! report files; the async orchestrator lives in `mend-runner`.

pub mod acceptance;
pub mod bug;
pub mod ci;
pub mod config;
pub mod diff;
pub mod escalation;
pub mod event;
pub mod fingerprint;
pub mod fix;
pub mod gate;
pub mod history;
pub mod outcome;
pub mod provider;
pub mod report;
pub mod run;
pub mod telemetry;
