use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use sdm_core::{Result, SdmError};

/// Covariate indices assigned to one trial; distinct within the set.
pub type TrialIndexSet = Vec<usize>;

/// Draws per-trial covariate subsets.
pub struct TrialPlanner {
    rng: StdRng,
}

impl TrialPlanner {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `num_trials` independent samples of `num_predictors` distinct indices
    /// from `0..population`.
    pub fn plan(
        &mut self,
        num_trials: usize,
        num_predictors: usize,
        population: usize,
    ) -> Result<Vec<TrialIndexSet>> {
        if num_trials < 1 {
            return Err(SdmError::config("num_trials must be at least 1"));
        }
        if num_predictors < 1 {
            return Err(SdmError::config("num_predictors must be at least 1"));
        }
        if num_predictors > population {
            return Err(SdmError::config(format!(
                "num_predictors ({}) exceeds the {} available covariates",
                num_predictors, population
            )));
        }
        Ok((0..num_trials)
            .map(|_| index::sample(&mut self.rng, population, num_predictors).into_vec())
            .collect())
    }
}
