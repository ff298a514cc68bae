//! azgrid-detached — run code on a persistent VM over HTTP.
//!
//! The server side lives on a provisioned VM: an axum service under
//! `/cofii/detached/` that accepts code payloads, executes them with
//! stdout/stderr captured to files, and answers status/wait/output
//! queries by job id. The client side provisions the VM (or targets an
//! existing one by IP), submits jobs, and retrieves results.

pub mod client;
pub mod error;
pub mod registry;
pub mod runner;
pub mod server;
mod spinner;

pub use client::{
    addproc, detached_run, detached_run_at, rmproc, AddProcOptions, DetachedClient,
    DetachedJobHandle, OutputStream,
};
pub use error::{DetachedError, DetachedResult};
pub use registry::{ExeConfig, JobRegistry, JobState};
pub use server::{build_router, serve, ServerState};
