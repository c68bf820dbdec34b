//! Maximum-likelihood theta estimation for one category.
//!
//! Minimizes the negative 3PL log-likelihood with projected Fisher scoring
//! on `[theta_min, theta_max]`, starting from `initial_theta`. Every
//! accepted step is backtracked until the objective does not increase, so
//! the iterate never leaves the bounds and the loop always terminates within
//! `max_iterations`.

use serde::{Deserialize, Serialize};

use crate::cat::config::EstimatorConfig;
use crate::cat::error::CatError;
use crate::cat::metrics::{registry, AlgorithmId};
use crate::cat::modeling::irt;
use crate::cat::types::{ItemParams, Response};
use crate::track_algorithm;

const MAX_BACKTRACKS: usize = 30;
const MIN_INFORMATION: f64 = 1e-9;

/// One graded observation fed to the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub params: ItemParams,
    pub correct: bool,
}

impl From<&Response> for Observation {
    fn from(response: &Response) -> Self {
        Self {
            params: response.params,
            correct: response.correct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThetaEstimate {
    pub theta: f64,
    pub standard_error: Option<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// Set when the optimizer failed and `theta` is the configured fallback.
    pub fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AbilityEstimator {
    config: EstimatorConfig,
}

impl AbilityEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate theta, substituting the fallback when the optimizer fails.
    ///
    /// Input errors are still returned; only convergence failure is
    /// recovered, and it is logged and counted.
    pub fn estimate(&self, observations: &[Observation]) -> Result<ThetaEstimate, CatError> {
        let result = track_algorithm!(AlgorithmId::AbilityEstimator, self.maximize(observations));
        match result {
            Ok(estimate) => Ok(estimate),
            Err(CatError::ConvergenceFailure { iterations }) => {
                registry().record_error(AlgorithmId::AbilityEstimator);
                tracing::warn!(
                    iterations,
                    responses = observations.len(),
                    fallback = self.config.fallback_theta,
                    "ability estimation did not converge, using fallback theta"
                );
                Ok(ThetaEstimate {
                    theta: self.config.fallback_theta,
                    standard_error: None,
                    iterations,
                    converged: false,
                    fallback: true,
                })
            }
            Err(err) => {
                registry().record_error(AlgorithmId::AbilityEstimator);
                Err(err)
            }
        }
    }

    pub fn estimate_responses(&self, responses: &[Response]) -> Result<ThetaEstimate, CatError> {
        let observations: Vec<Observation> = responses.iter().map(Observation::from).collect();
        self.estimate(&observations)
    }

    /// Raw optimizer. Returns `ConvergenceFailure` when the iteration budget
    /// runs out.
    pub fn maximize(&self, observations: &[Observation]) -> Result<ThetaEstimate, CatError> {
        if observations.is_empty() {
            return Err(CatError::InvalidInput(
                "ability estimation needs at least one response".to_string(),
            ));
        }
        for obs in observations {
            obs.params.validate()?;
        }

        let lo = self.config.theta_min;
        let hi = self.config.theta_max;
        let mut theta = self.config.initial_theta.clamp(lo, hi);
        let mut nll = negative_log_likelihood(theta, observations);

        for iteration in 1..=self.config.max_iterations {
            let gradient = -total_score(theta, observations);
            let information = total_information(theta, observations).max(MIN_INFORMATION);

            let at_lower = theta <= lo && gradient > 0.0;
            let at_upper = theta >= hi && gradient < 0.0;
            if at_lower || at_upper || gradient.abs() < self.config.tolerance {
                return Ok(self.finish(theta, observations, iteration, true));
            }

            let direction = -gradient / information;
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let candidate = (theta + step * direction).clamp(lo, hi);
                let candidate_nll = negative_log_likelihood(candidate, observations);
                if candidate_nll <= nll {
                    accepted = Some((candidate, candidate_nll));
                    break;
                }
                step *= 0.5;
            }

            let Some((next, next_nll)) = accepted else {
                // No descent along the scoring direction: theta is a minimum
                // up to floating-point resolution.
                return Ok(self.finish(theta, observations, iteration, true));
            };

            let moved = (next - theta).abs();
            theta = next;
            nll = next_nll;
            if moved < self.config.tolerance {
                return Ok(self.finish(theta, observations, iteration, true));
            }
        }

        Err(CatError::ConvergenceFailure {
            iterations: self.config.max_iterations,
        })
    }

    fn finish(
        &self,
        theta: f64,
        observations: &[Observation],
        iterations: usize,
        converged: bool,
    ) -> ThetaEstimate {
        let information = total_information(theta, observations);
        let standard_error = if information > 0.0 {
            Some(1.0 / information.sqrt())
        } else {
            None
        };
        ThetaEstimate {
            theta,
            standard_error,
            iterations,
            converged,
            fallback: false,
        }
    }
}

pub fn negative_log_likelihood(theta: f64, observations: &[Observation]) -> f64 {
    -observations
        .iter()
        .map(|obs| irt::log_likelihood(theta, &obs.params, obs.correct))
        .sum::<f64>()
}

fn total_score(theta: f64, observations: &[Observation]) -> f64 {
    observations
        .iter()
        .map(|obs| irt::score(theta, &obs.params, obs.correct))
        .sum()
}

fn total_information(theta: f64, observations: &[Observation]) -> f64 {
    observations
        .iter()
        .map(|obs| irt::item_information(theta, &obs.params))
        .sum()
}
