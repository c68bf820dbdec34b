pub mod elo;
pub mod estimation;
pub mod irt;

pub use elo::{EloRater, EloRule, EloUpdate};
pub use estimation::{AbilityEstimator, ThetaEstimate};
