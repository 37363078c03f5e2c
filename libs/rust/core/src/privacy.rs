//! Differential-privacy budget accounting.
//! Only the ledger is modelled; no noise is ever applied to updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyParams {
    pub epsilon: f64,
    pub delta: f64,
    pub noise_multiplier: f64,
}

impl Default for PrivacyParams { fn default() -> Self { Self { epsilon: 1.0, delta: 1e-5, noise_multiplier: 1.1 } } }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudgetLogEntry {
    pub id: Uuid,
    pub model_id: String,
    pub round_id: Uuid,
    pub epsilon_consumed: f64,
    pub cumulative_epsilon: f64,
    pub budget_limit: f64,
    pub created_at: DateTime<Utc>,
}

impl PrivacyBudgetLogEntry {
    /// Next ledger entry after `previous` for the same model.
    pub fn next(previous: Option<&PrivacyBudgetLogEntry>, model_id: &str, round_id: Uuid, epsilon: f64, budget_limit: f64) -> Self {
        let prior = previous.map(|p| p.cumulative_epsilon).unwrap_or(0.0);
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.to_string(),
            round_id,
            epsilon_consumed: epsilon.max(0.0),
            cumulative_epsilon: prior + epsilon.max(0.0),
            budget_limit,
            created_at: Utc::now(),
        }
    }

    pub fn exceeded(&self) -> bool { self.cumulative_epsilon > self.budget_limit }
    pub fn remaining(&self) -> f64 { (self.budget_limit - self.cumulative_epsilon).max(0.0) }

    /// Whether this entry correctly follows `previous` in the ledger.
    pub fn follows(&self, previous: Option<&PrivacyBudgetLogEntry>) -> bool {
        let prior = previous.map(|p| p.cumulative_epsilon).unwrap_or(0.0);
        (prior + self.epsilon_consumed - self.cumulative_epsilon).abs() < 1e-9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_accumulates() {
        let first = PrivacyBudgetLogEntry::next(None, "m", Uuid::new_v4(), 1.5, 4.0);
        let second = PrivacyBudgetLogEntry::next(Some(&first), "m", Uuid::new_v4(), 2.0, 4.0);
        let third = PrivacyBudgetLogEntry::next(Some(&second), "m", Uuid::new_v4(), 1.0, 4.0);
        assert_eq!(first.cumulative_epsilon, 1.5);
        assert_eq!(second.cumulative_epsilon, 3.5);
        assert!(third.follows(Some(&second)));
        assert!(!third.follows(Some(&first)));
        assert!(third.exceeded());
        assert_eq!(second.remaining(), 0.5);
    }

    #[test]
    fn negative_epsilon_is_clamped() {
        let e = PrivacyBudgetLogEntry::next(None, "m", Uuid::new_v4(), -3.0, 10.0);
        assert_eq!(e.epsilon_consumed, 0.0);
        assert_eq!(e.cumulative_epsilon, 0.0);
    }
}
