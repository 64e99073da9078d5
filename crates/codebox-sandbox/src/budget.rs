//! Per-execution tool-call budget.

use thiserror::Error;

/// The budget was already spent when a call arrived.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("tool call limit exceeded (max {max} calls per execution)")]
pub struct BudgetExhausted {
    /// The configured maximum.
    pub max: usize,
}

/// Counts dispatched tool calls against `max_tool_calls`.
///
/// The count only grows. It is compared against the limit before each
/// dispatch, so it never exceeds the limit and a rejected call never counts.
#[derive(Debug, Clone)]
pub struct CallBudget {
    max: usize,
    dispatched: usize,
    rejected: usize,
}

impl CallBudget {
    /// A fresh budget allowing `max` dispatches.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            dispatched: 0,
            rejected: 0,
        }
    }

    /// Reserve one dispatch. Returns the new count on success.
    pub fn try_acquire(&mut self) -> Result<usize, BudgetExhausted> {
        if self.dispatched >= self.max {
            self.rejected += 1;
            return Err(BudgetExhausted { max: self.max });
        }
        self.dispatched += 1;
        Ok(self.dispatched)
    }

    /// Calls dispatched so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Calls rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_until_limit_then_rejects() {
        let mut budget = CallBudget::new(2);
        assert_eq!(budget.try_acquire(), Ok(1));
        assert_eq!(budget.try_acquire(), Ok(2));
        assert_eq!(budget.rejected(), 0);

        let err = budget.try_acquire().unwrap_err();
        assert_eq!(err.max, 2);
        assert!(err.to_string().contains("max 2"));

        // Rejections never move the count.
        assert!(budget.try_acquire().is_err());
        assert_eq!(budget.dispatched(), 2);
        assert_eq!(budget.rejected(), 2);
    }

    #[test]
    fn zero_budget_rejects_everything() {
        let mut budget = CallBudget::new(0);
        assert!(budget.try_acquire().is_err());
        assert_eq!(budget.dispatched(), 0);
    }
}
