use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TogglesConfig;
use crate::domain::customer::UserId;

pub const DEFAULT_HALLUCINATION_USER: &str = "user_007";

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ToggleError {
    #[error("api error rate must be a finite value in [0, 1), got {0}")]
    InvalidErrorRate(f64),
    #[error("unknown fault toggle `{0}` (expected drift|hallucination)")]
    UnknownToggle(String),
}

/// Probability that a tool call reports a simulated failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ErrorRate(f64);

impl ErrorRate {
    pub const ZERO: ErrorRate = ErrorRate(0.0);

    pub fn new(value: f64) -> Result<Self, ToggleError> {
        if value.is_finite() && (0.0..1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ToggleError::InvalidErrorRate(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

impl TryFrom<f64> for ErrorRate {
    type Error = ToggleError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ErrorRate> for f64 {
    fn from(rate: ErrorRate) -> Self {
        rate.0
    }
}

impl fmt::Display for ErrorRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Named switches accepted on the command line (`--toggles drift hallucination`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleName {
    Drift,
    Hallucination,
}

impl ToggleName {
    pub fn parse(value: &str) -> Result<Self, ToggleError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drift" | "policy_drift" => Ok(Self::Drift),
            "hallucination" | "llm_hallucination" => Ok(Self::Hallucination),
            other => Err(ToggleError::UnknownToggle(other.to_string())),
        }
    }
}

/// Fault-injection switches for one pipeline run. Resolved once before the
/// run starts and passed by value; agents never read process state for these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultToggles {
    pub policy_drift: bool,
    pub llm_hallucination: bool,
    pub hallucination_user_id: UserId,
    pub api_error_rate: ErrorRate,
    /// Seed for the simulated-failure draws. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for FaultToggles {
    fn default() -> Self {
        Self {
            policy_drift: false,
            llm_hallucination: false,
            hallucination_user_id: UserId::new(DEFAULT_HALLUCINATION_USER),
            api_error_rate: ErrorRate::ZERO,
            seed: None,
        }
    }
}

impl FaultToggles {
    pub fn from_config(config: &TogglesConfig) -> Result<Self, ToggleError> {
        Ok(Self {
            policy_drift: config.policy_drift,
            llm_hallucination: config.llm_hallucination,
            hallucination_user_id: UserId::new(config.hallucination_user_id.clone()),
            api_error_rate: ErrorRate::new(config.api_error_rate)?,
            seed: config.seed,
        })
    }

    pub fn enable(mut self, toggle: ToggleName) -> Self {
        match toggle {
            ToggleName::Drift => self.policy_drift = true,
            ToggleName::Hallucination => self.llm_hallucination = true,
        }
        self
    }

    pub fn with_error_rate(mut self, rate: ErrorRate) -> Self {
        self.api_error_rate = rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether the classifier should be swapped for the fixed substitute for
    /// this user.
    pub fn substitutes_classification_for(&self, user_id: &UserId) -> bool {
        self.llm_hallucination && &self.hallucination_user_id == user_id
    }

    pub fn active_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.policy_drift {
            names.push("drift");
        }
        if self.llm_hallucination {
            names.push("hallucination");
        }
        if !self.api_error_rate.is_zero() {
            names.push("api_errors");
        }
        names
    }
}
