//! Recovery policy for supervised background operations.
//
// The task engine consults a `RecoveryPolicy` whenever an operation finishes
// with an error. The policy decides whether the failure is retried, reported,
// or both, and how long to wait before the next attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the engine does with an operation once its retry budget is spent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Leave the operation stopped in the registry until it is unregistered.
    #[default]
    Park,
    /// Keep re-running it on every pass. The owner is still told only once per
    /// failure streak.
    KeepRetrying,
}

/// Defines a policy for retrying a failed operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Retries attempted before the failure is reported to the owner.
    pub max_retries: u32,
    /// The delay before each retry attempt.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Behaviour after `max_retries` consecutive failures.
    pub on_exhausted: ExhaustedAction,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_delay: Duration::ZERO,
            on_exhausted: ExhaustedAction::Park,
        }
    }
}

/// Outcome of consulting the policy after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Re-run the operation after the delay.
    Retry(Duration),
    /// Report the failure and re-run after the delay.
    ReportAndRetry(Duration),
    /// Report the failure and leave the operation stopped.
    ReportAndPark,
    /// Already reported for this streak; re-run silently.
    RetrySilently(Duration),
    /// Already reported for this streak; stay stopped.
    Park,
}

impl RecoveryDecision {
    /// True if the owner must be notified.
    pub fn reports(&self) -> bool {
        matches!(self, Self::ReportAndRetry(_) | Self::ReportAndPark)
    }

    /// Delay before the next attempt, if the operation is re-run.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Retry(d) | Self::ReportAndRetry(d) | Self::RetrySilently(d) => Some(*d),
            Self::ReportAndPark | Self::Park => None,
        }
    }
}

impl RecoveryPolicy {
    /// A policy that never gives up on an operation.
    pub fn keep_retrying() -> Self {
        Self {
            on_exhausted: ExhaustedAction::KeepRetrying,
            ..Self::default()
        }
    }

    /// Decides what to do after the `consecutive_failures`-th failure in a row
    /// (counting from 1). `already_reported` tells whether the owner has been
    /// told about the current streak.
    pub fn decide(&self, consecutive_failures: u32, already_reported: bool) -> RecoveryDecision {
        if consecutive_failures <= self.max_retries {
            return RecoveryDecision::Retry(self.retry_delay);
        }
        match (self.on_exhausted, already_reported) {
            (ExhaustedAction::Park, false) => RecoveryDecision::ReportAndPark,
            (ExhaustedAction::Park, true) => RecoveryDecision::Park,
            (ExhaustedAction::KeepRetrying, false) => {
                RecoveryDecision::ReportAndRetry(self.retry_delay)
            }
            (ExhaustedAction::KeepRetrying, true) => {
                RecoveryDecision::RetrySilently(self.retry_delay)
            }
        }
    }
}
