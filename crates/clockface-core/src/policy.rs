//! Shift policy: classifies check-in lateness and check-out earliness.

use crate::types::EmployeeId;
use chrono::{Duration, NaiveTime};

/// Expected working hours for a shift, in local wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftPolicy {
    pub start: NaiveTime,
    /// Check-ins up to `start + grace` (inclusive) are on time.
    pub grace: Duration,
    pub end: NaiveTime,
    /// Check-outs strictly before this are early leave.
    pub early_leave_before: NaiveTime,
}

/// Check-in classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    OnTime,
    /// Whole minutes after the shift start.
    Late { minutes: i64 },
}

impl ShiftPolicy {
    /// Build a policy whose early-leave threshold is `early_leave_minutes` before `end`.
    pub fn new(start: NaiveTime, grace_minutes: u32, end: NaiveTime, early_leave_minutes: u32) -> Self {
        let (early_leave_before, _) =
            end.overflowing_sub_signed(Duration::minutes(i64::from(early_leave_minutes)));
        Self {
            start,
            grace: Duration::minutes(i64::from(grace_minutes)),
            end,
            early_leave_before,
        }
    }

    pub fn classify_check_in(&self, local: NaiveTime) -> Arrival {
        let after_start = local.signed_duration_since(self.start);
        if after_start <= self.grace {
            Arrival::OnTime
        } else {
            Arrival::Late {
                minutes: after_start.num_minutes(),
            }
        }
    }

    /// Whole minutes before the shift end if this check-out is early leave.
    pub fn early_leave_minutes(&self, local: NaiveTime) -> Option<i64> {
        (local < self.early_leave_before).then(|| self.end.signed_duration_since(local).num_minutes())
    }
}

impl Default for ShiftPolicy {
    /// 09:00–17:00 with a ten minute grace window; leaving any time before 17:00 is early.
    fn default() -> Self {
        Self::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            10,
            NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            0,
        )
    }
}

/// Where the ledger gets an employee's shift.
pub trait ShiftPolicySource: Send + Sync {
    fn policy_for(&self, employee_id: &EmployeeId) -> ShiftPolicy;
}

/// A single policy is the organization-wide default for everyone.
impl ShiftPolicySource for ShiftPolicy {
    fn policy_for(&self, _employee_id: &EmployeeId) -> ShiftPolicy {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_within_grace_is_on_time() {
        let p = ShiftPolicy::new(t(9, 0), 10, t(17, 0), 0);
        assert_eq!(p.classify_check_in(t(8, 30)), Arrival::OnTime);
        assert_eq!(p.classify_check_in(t(9, 5)), Arrival::OnTime);
        assert_eq!(p.classify_check_in(t(9, 10)), Arrival::OnTime);
    }

    #[test]
    fn test_after_grace_is_late() {
        let p = ShiftPolicy::new(t(9, 0), 10, t(17, 0), 0);
        assert_eq!(p.classify_check_in(t(9, 20)), Arrival::Late { minutes: 20 });
        let just_after = NaiveTime::from_hms_opt(9, 10, 1).unwrap();
        assert_eq!(p.classify_check_in(just_after), Arrival::Late { minutes: 10 });
    }

    #[test]
    fn test_early_leave() {
        let p = ShiftPolicy::new(t(9, 0), 10, t(17, 0), 0);
        assert_eq!(p.early_leave_minutes(t(16, 0)), Some(60));
        assert_eq!(p.early_leave_minutes(t(17, 0)), None);
        assert_eq!(p.early_leave_minutes(t(18, 0)), None);
    }

    #[test]
    fn test_early_leave_threshold_offset_from_end() {
        let p = ShiftPolicy::new(t(9, 0), 10, t(17, 0), 15);
        assert_eq!(p.early_leave_before, t(16, 45));
        assert_eq!(p.early_leave_minutes(t(16, 50)), None);
        assert_eq!(p.early_leave_minutes(t(16, 30)), Some(30));
    }

    #[test]
    fn test_default_policy() {
        let p = ShiftPolicy::default();
        assert_eq!(p.start, t(9, 0));
        assert_eq!(p.grace, Duration::minutes(10));
        assert_eq!(p.early_leave_before, t(17, 0));
    }
}
