pub mod admission;
pub mod cert;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod panel;
pub mod task;
pub mod telemetry;

pub use controller::Controller;
pub use error::{NodeError, Result};
pub use limiter::{Admission, Limiter, LimiterRegistry};
