//! Bounded fan-out of work items over child processes.
//!
//! [`pool::Pool`] keeps at most N polled processes running and reports their
//! lifecycle through [`pool::Lifecycle`]. [`batch::Batch`] builds one
//! re-executed child per work item on top of it and turns the results into a
//! success, warnings, or an [`error::Error::BatchFailed`] report.

pub mod batch;
pub mod children;
pub mod command;
pub mod config;
pub mod error;
pub mod output;
pub mod parser;
pub mod pool;
pub mod worker;
