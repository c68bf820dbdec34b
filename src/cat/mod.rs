pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod modeling;
pub mod persistence;
pub mod types;

pub use config::CatConfig;
pub use engine::{AdaptiveTestingController, QuizPlan};
pub use error::CatError;
pub use types::*;
