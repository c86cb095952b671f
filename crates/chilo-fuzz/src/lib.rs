#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod abi;
pub mod config;
pub mod error;
pub mod factory;
pub mod llm;
pub mod mask;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod seed;
pub mod telemetry;

pub use config::Config;
pub use error::ChiloError;
pub use factory::Factory;
pub use seed::{Seed, SeedId};
