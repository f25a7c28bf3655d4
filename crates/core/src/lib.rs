//! Request-scoped context propagation and structured failure reporting.
//!
//! - [`context`]: task-local store of per-request ambient values.
//! - [`exception`]: [`HttpException`](exception::HttpException) and the
//!   [`ApiError`](exception::ApiError) carrier used with `?`.
//! - [`trace`]: call-site capture, backtrace resolution, panic capture.
//! - [`config`], [`lifecycle`]: configuration, logging and shutdown.

pub mod config;
pub mod context;
pub mod exception;
pub mod lifecycle;
pub mod trace;
