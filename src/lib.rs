#![allow(async_fn_in_trait)]

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod store;

pub use config::{AppConfig, PriorityThresholds};
pub use db::{create_pool, PgStore};
pub use error::MatchError;
pub use service::{ExceptionWorkflow, MatchOrchestrator, PaymentGate};
pub use store::MemoryStore;
