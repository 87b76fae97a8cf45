#![doc = "Acquisition engine: per-device workers, scheduling, health tracking, and the time-series writer."]

pub mod bus;
pub mod engine;
pub mod health;
pub mod rate;
pub mod scheduler;
pub mod tsdb;
pub mod worker;

pub use bus::{HealthBus, ObservationBus};
pub use engine::{ConnectivityTestResult, Engine};
pub use health::{HealthTracker, PollOutcome};
pub use rate::RateEngine;
pub use scheduler::{Scheduler, DEFAULT_STOP_GRACE_PERIOD};
pub use tsdb::TsdbWriter;
pub use worker::{spawn as spawn_worker, WorkerHandle};
