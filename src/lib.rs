//! Computerized adaptive testing core.
//!
//! Estimates per-category learner ability from graded responses (3PL maximum
//! likelihood and Elo), and picks the next items with a trainable,
//! checkpointed selection agent.

pub mod cat;
pub mod config;
pub mod db;
pub mod logging;

pub use cat::engine::AdaptiveTestingController;
pub use cat::{CatConfig, CatError};
