//! Triage — a container fleet watchdog with AI diagnosis.
//!
//! Watches Docker containers carrying a label selector, diagnoses failures
//! with an LLM, and either reports (check mode) or restarts with bounded
//! retries (heal mode). Alerts go out by email and into an append-only
//! alert log.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod config;
pub mod credentials;
pub mod diagnosis;
pub mod healer;
pub mod incident;
pub mod logging;
pub mod orchestrator;
pub mod runtime;
