use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{ExecError, FailureReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_version() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    pub max_attempts: Option<u32>, // None = infinite
    pub max_delay: Option<f64>,    // seconds, None = no time limit
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_fixed")]
    pub strategy: WaitStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>, // for fixed strategy
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

fn default_fixed() -> WaitStrategy {
    WaitStrategy::Fixed
}

fn default_initial_delay() -> f64 {
    10.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    120.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    Fixed,
    Exponential,       // Always deterministic
    ExponentialJitter, // Always has full jitter
}

/// Coarse classification of a failed remote step, used to decide retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    AuthFailure,
    Transport,
    NonZeroExit,
    ConditionUnmet,
}

impl FailureKind {
    pub fn of_exec_error(err: &ExecError) -> Self {
        match err {
            ExecError::Timeout(_) => FailureKind::Timeout,
            ExecError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            ExecError::AuthFailure(_) => FailureKind::AuthFailure,
            ExecError::Transport(_) => FailureKind::Transport,
        }
    }

    pub fn of_reason(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::Exec { transport, .. } => *transport,
            FailureReason::NonZeroExit { .. } => FailureKind::NonZeroExit,
            FailureReason::ConditionUnmet { .. } => FailureKind::ConditionUnmet,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::Transport => "transport",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::ConditionUnmet => "condition_unmet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_include_errors")]
    pub include_errors: Vec<FailureKind>,
    #[serde(default = "default_exclude_errors")]
    pub exclude_errors: Vec<FailureKind>,
}

fn default_include_errors() -> Vec<FailureKind> {
    vec![
        FailureKind::Timeout,
        FailureKind::ConnectionRefused,
        FailureKind::Transport,
        FailureKind::NonZeroExit,
        FailureKind::ConditionUnmet,
    ]
}

fn default_exclude_errors() -> Vec<FailureKind> {
    vec![FailureKind::AuthFailure]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            version: 1,
            stop: StopConfig::default(),
            wait: WaitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            max_delay: None,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            strategy: WaitStrategy::Fixed,
            delay: None,
            initial_delay: 10.0,
            multiplier: 2.0,
            max_delay: 120.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            include_errors: default_include_errors(),
            exclude_errors: default_exclude_errors(),
        }
    }
}

impl WaitConfig {
    pub fn calculate_delay(&self, attempt_number: u32) -> Duration {
        let delay_secs = match self.strategy {
            WaitStrategy::Fixed => self.delay.unwrap_or(self.initial_delay),
            WaitStrategy::Exponential => {
                let base_delay = self.initial_delay * self.multiplier.powi(attempt_number as i32);
                base_delay.min(self.max_delay)
            }
            WaitStrategy::ExponentialJitter => {
                let base_delay = self.initial_delay * self.multiplier.powi(attempt_number as i32);
                let capped_delay = base_delay.min(self.max_delay);

                let mut rng = rand::thread_rng();
                rng.gen_range(0.0..=capped_delay)
            }
        };

        Duration::from_secs_f64(delay_secs)
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err("Unsupported retry policy version".to_string());
        }

        if let Some(max_attempts) = self.stop.max_attempts {
            if max_attempts == 0 {
                return Err("max_attempts must be >= 1".to_string());
            }
        }

        if self.wait.multiplier < 1.0 {
            return Err("multiplier must be >= 1".to_string());
        }

        if self.wait.initial_delay < 0.0 || self.wait.max_delay < 0.0 {
            return Err("delay values must be >= 0".to_string());
        }

        if let Some(delay) = self.wait.delay {
            if delay < 0.0 {
                return Err("delay must be >= 0".to_string());
            }
        }

        Ok(())
    }

    /// Whether another attempt may follow `attempts_made` failed attempts that
    /// together took `elapsed`, the last one failing with `kind`.
    pub fn should_retry(&self, kind: FailureKind, attempts_made: u32, elapsed: Duration) -> bool {
        if !should_retry_error(&self.retry, kind) {
            return false;
        }

        if let Some(max_attempts) = self.stop.max_attempts {
            if attempts_made >= max_attempts {
                return false;
            }
        }

        if let Some(max_delay) = self.stop.max_delay {
            if elapsed.as_secs_f64() >= max_delay {
                return false;
            }
        }

        true
    }
}

/// Exclusions win over inclusions.
pub fn should_retry_error(retry_config: &RetryConfig, kind: FailureKind) -> bool {
    !retry_config.exclude_errors.contains(&kind) && retry_config.include_errors.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =============================================================================
    // Basic Structure and Defaults Tests
    // =============================================================================

    /// Addon installs retry three times on a fixed ten second cadence.
    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.version, 1);
        assert_eq!(policy.stop.max_attempts, Some(3));
        assert_eq!(policy.stop.max_delay, None);
        assert_eq!(policy.wait.strategy, WaitStrategy::Fixed);
        assert_eq!(policy.wait.calculate_delay(0), Duration::from_secs(10));
        assert!(policy.retry.exclude_errors.contains(&FailureKind::AuthFailure));
        assert!(policy.validate().is_ok());
    }

    // =============================================================================
    // Wait Strategy Tests
    // =============================================================================

    #[test]
    fn test_wait_strategy_fixed() {
        let config = WaitConfig {
            strategy: WaitStrategy::Fixed,
            delay: Some(10.0),
            ..Default::default()
        };

        assert_eq!(config.calculate_delay(0), Duration::from_secs(10));
        assert_eq!(config.calculate_delay(5), Duration::from_secs(10));

        let config_no_delay = WaitConfig {
            strategy: WaitStrategy::Fixed,
            delay: None,
            initial_delay: 5.0,
            ..Default::default()
        };
        assert_eq!(config_no_delay.calculate_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_wait_strategy_exponential() {
        let config = WaitConfig {
            strategy: WaitStrategy::Exponential,
            initial_delay: 1.0,
            multiplier: 2.0,
            max_delay: 10.0,
            ..Default::default()
        };

        // 1, 2, 4, 8, 10 (capped)
        assert_eq!(config.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(config.calculate_delay(3), Duration::from_secs(8));
        assert_eq!(config.calculate_delay(4), Duration::from_secs(10));
        assert_eq!(config.calculate_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_wait_strategy_exponential_jitter_stays_in_bounds() {
        let config = WaitConfig {
            strategy: WaitStrategy::ExponentialJitter,
            initial_delay: 1.0,
            multiplier: 10.0,
            max_delay: 5.0,
            ..Default::default()
        };

        for attempt in 0..5 {
            for _ in 0..20 {
                let delay = config.calculate_delay(attempt);
                assert!(
                    delay <= Duration::from_secs(5),
                    "Jittered delay {delay:?} exceeded max_delay for attempt {attempt}"
                );
            }
        }
    }

    // =============================================================================
    // Retry Condition Logic Tests
    // =============================================================================

    #[test]
    fn test_retry_error_filtering() {
        let config = RetryConfig {
            include_errors: vec![FailureKind::Timeout, FailureKind::NonZeroExit],
            exclude_errors: vec![FailureKind::NonZeroExit],
        };

        // Exclude takes precedence over include.
        assert!(!should_retry_error(&config, FailureKind::NonZeroExit));
        assert!(should_retry_error(&config, FailureKind::Timeout));
        assert!(!should_retry_error(&config, FailureKind::ConditionUnmet));
    }

    #[test]
    fn test_should_retry_respects_attempts_and_deadline() {
        let policy = RetryPolicy {
            stop: StopConfig {
                max_attempts: Some(3),
                max_delay: Some(60.0),
            },
            ..Default::default()
        };

        assert!(policy.should_retry(FailureKind::NonZeroExit, 1, Duration::ZERO));
        assert!(policy.should_retry(FailureKind::NonZeroExit, 2, Duration::from_secs(30)));
        assert!(!policy.should_retry(FailureKind::NonZeroExit, 3, Duration::ZERO));
        assert!(!policy.should_retry(FailureKind::NonZeroExit, 1, Duration::from_secs(61)));
        assert!(!policy.should_retry(FailureKind::AuthFailure, 1, Duration::ZERO));
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            FailureKind::of_exec_error(&ExecError::Timeout(Duration::from_secs(1))),
            FailureKind::Timeout
        );
        assert_eq!(
            FailureKind::of_reason(&(&ExecError::AuthFailure("denied".into())).into()),
            FailureKind::AuthFailure
        );
        assert_eq!(
            FailureKind::of_reason(&(&ExecError::ConnectionRefused("x".into())).into()),
            FailureKind::ConnectionRefused
        );
        // The kind travels with the reason, not its message.
        let relabelled = FailureReason::Exec {
            transport: FailureKind::Timeout,
            message: "connection refused by bastion".to_string(),
        };
        assert_eq!(FailureKind::of_reason(&relabelled), FailureKind::Timeout);
        assert_eq!(
            FailureKind::of_reason(&FailureReason::NonZeroExit {
                code: 1,
                stderr: String::new()
            }),
            FailureKind::NonZeroExit
        );
    }

    // =============================================================================
    // Deserialization and Validation Tests
    // =============================================================================

    #[test]
    fn test_partial_json_with_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({
            "stop": {"max_attempts": 5},
            "wait": {"strategy": "exponential", "initial_delay": 2},
            "retry": {"include_errors": ["timeout"]}
        }))
        .unwrap();

        assert_eq!(policy.stop.max_attempts, Some(5));
        assert_eq!(policy.wait.strategy, WaitStrategy::Exponential);
        assert_eq!(policy.wait.initial_delay, 2.0);
        assert_eq!(policy.retry.include_errors, vec![FailureKind::Timeout]);
        assert_eq!(policy.retry.exclude_errors, vec![FailureKind::AuthFailure]);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_invalid_json_parsing() {
        assert!(serde_json::from_value::<RetryPolicy>(json!({
            "wait": {"strategy": "invalid_strategy"}
        }))
        .is_err());

        assert!(serde_json::from_value::<RetryPolicy>(json!({
            "retry": {"include_errors": ["ValueError"]}
        }))
        .is_err());
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.version = 2;
        assert!(policy.validate().is_err());
        policy.version = 1;

        policy.stop.max_attempts = Some(0);
        assert!(policy.validate().is_err());
        policy.stop.max_attempts = Some(1);
        assert!(policy.validate().is_ok());

        policy.wait.multiplier = 0.99;
        assert!(policy.validate().is_err());
        policy.wait.multiplier = 1.0;
        assert!(policy.validate().is_ok());

        policy.wait.initial_delay = -0.1;
        assert!(policy.validate().is_err());
        policy.wait.initial_delay = 0.0;
        assert!(policy.validate().is_ok());

        policy.wait.delay = Some(-1.0);
        assert!(policy.validate().is_err());
    }
}
