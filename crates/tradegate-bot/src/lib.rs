//! tradegate controller.
//!
//! Wires the admission pipeline to durable storage and runs:
//! - one evaluator per configured account
//! - the command reconciler
//! - optionally the paper gateway (dry runs)

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
