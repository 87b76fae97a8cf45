#![doc = "Common types shared across the acquisition engine workspace."]

pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod state;
pub mod time;

pub use config::*;
pub use error::*;
pub use executor::{execute, Classification, OperationResult};
pub use health::*;
pub use metrics::*;
pub use model::*;
pub use retry::*;
pub use state::*;
pub use time::*;
