//! Execution backends for the ASG.
//!
//! Each submodule is a backend able to run a computation graph, plus the
//! [`Session`](session::Session) that drives one.

pub mod backend;
pub mod cpu_backend;
pub mod session;
