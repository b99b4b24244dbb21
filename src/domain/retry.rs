use serde::{Deserialize, Serialize};
use std::fmt;

/// How a paused deal may be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Resume automatically when the provider restarts
    Auto,
    /// Wait for an operator to retry or fail the deal
    Manual,
    /// The deal cannot be retried
    Fatal,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::Auto => "AUTO",
            RetryPolicy::Manual => "MANUAL",
            RetryPolicy::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RetryPolicy {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "AUTO" => Ok(RetryPolicy::Auto),
            "MANUAL" => Ok(RetryPolicy::Manual),
            "FATAL" => Ok(RetryPolicy::Fatal),
            _ => Err(format!("Unknown retry policy: {}", s)),
        }
    }
}

/// What prompted a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    /// Provider restarted with the deal still active
    Restart,
    /// Operator asked to retry (`true`) or fail (`false`) a paused deal
    Operator { retry: bool },
}

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Continue execution from the last checkpoint
    Resume,
    /// Leave the deal paused
    Park,
    /// Terminate the deal and release its resources
    Fail,
}

/// Single decision table shared by recovery and operator retry/fail requests.
pub fn retry_action(policy: RetryPolicy, trigger: RetryTrigger) -> RetryAction {
    match (trigger, policy) {
        (RetryTrigger::Restart, RetryPolicy::Auto) => RetryAction::Resume,
        (RetryTrigger::Restart, RetryPolicy::Manual | RetryPolicy::Fatal) => RetryAction::Park,
        (RetryTrigger::Operator { retry: true }, RetryPolicy::Auto | RetryPolicy::Manual) => {
            RetryAction::Resume
        }
        (RetryTrigger::Operator { retry: true }, RetryPolicy::Fatal) => RetryAction::Fail,
        (RetryTrigger::Operator { retry: false }, _) => RetryAction::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_decisions() {
        assert_eq!(
            retry_action(RetryPolicy::Auto, RetryTrigger::Restart),
            RetryAction::Resume
        );
        assert_eq!(
            retry_action(RetryPolicy::Manual, RetryTrigger::Restart),
            RetryAction::Park
        );
        assert_eq!(
            retry_action(RetryPolicy::Fatal, RetryTrigger::Restart),
            RetryAction::Park
        );
    }

    #[test]
    fn test_operator_decisions() {
        let retry = RetryTrigger::Operator { retry: true };
        let fail = RetryTrigger::Operator { retry: false };

        assert_eq!(retry_action(RetryPolicy::Manual, retry), RetryAction::Resume);
        assert_eq!(retry_action(RetryPolicy::Auto, retry), RetryAction::Resume);
        assert_eq!(retry_action(RetryPolicy::Fatal, retry), RetryAction::Fail);
        for policy in [RetryPolicy::Auto, RetryPolicy::Manual, RetryPolicy::Fatal] {
            assert_eq!(retry_action(policy, fail), RetryAction::Fail);
        }
    }

    #[test]
    fn test_policy_str_round_trip() {
        for policy in [RetryPolicy::Auto, RetryPolicy::Manual, RetryPolicy::Fatal] {
            assert_eq!(RetryPolicy::try_from(policy.as_str()), Ok(policy));
        }
    }
}
