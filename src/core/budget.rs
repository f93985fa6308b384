//! 单次激活的计算预算
//!
//! 每次激活有一个硬截止时间；剩余时间低于安全余量时必须写检查点并挂起。

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ComputeBudget {
    deadline: Instant,
    safety_margin: Duration,
}

impl ComputeBudget {
    pub fn new(total: Duration, safety_margin: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
            safety_margin,
        }
    }

    pub fn with_deadline(deadline: Instant, safety_margin: Duration) -> Self {
        Self {
            deadline,
            safety_margin,
        }
    }

    /// 距硬截止时间的剩余
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 可分配给 LLM / 工具的时间：扣除安全余量，保证之后仍来得及写检查点
    pub fn usable(&self) -> Duration {
        self.remaining().saturating_sub(self.safety_margin)
    }

    /// 工具与 LLM 调用必须在此之前结束
    pub fn usable_deadline(&self) -> Instant {
        self.deadline
            .checked_sub(self.safety_margin)
            .unwrap_or_else(Instant::now)
    }

    pub fn should_checkpoint(&self) -> bool {
        self.remaining() <= self.safety_margin
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_budget_does_not_checkpoint() {
        let b = ComputeBudget::new(Duration::from_secs(60), Duration::from_secs(5));
        assert!(!b.should_checkpoint());
        assert!(b.usable() <= Duration::from_secs(55));
        assert!(b.usable() > Duration::from_secs(50));
    }

    #[test]
    fn test_budget_inside_margin_checkpoints() {
        let b = ComputeBudget::new(Duration::from_millis(10), Duration::from_secs(1));
        assert!(b.should_checkpoint());
        assert_eq!(b.usable(), Duration::ZERO);
    }

    #[test]
    fn test_expired_budget() {
        let b = ComputeBudget::with_deadline(Instant::now(), Duration::ZERO);
        assert_eq!(b.remaining(), Duration::ZERO);
    }
}
