//! Attendance ledger: the per employee-day check-in/check-out state machine.
//!
//! A day moves NONE → CHECKED_IN → CHECKED_OUT and never back. Every
//! transition runs under a lock keyed by (employee, local date), reads the
//! current record, validates, and writes once. The repository independently
//! refuses a second insert for the same key and a second check-out write.

use crate::error::ErrorKind;
use crate::locks::{KeyedLocks, LockTimeout};
use crate::policy::{Arrival, ShiftPolicySource};
use crate::types::EmployeeId;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
    EarlyLeave,
    Absent,
    Pending,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
            Self::EarlyLeave => "early_leave",
            Self::Absent => "absent",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "on_time" => Ok(Self::OnTime),
            "late" => Ok(Self::Late),
            "early_leave" => Ok(Self::EarlyLeave),
            "absent" => Ok(Self::Absent),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Lifecycle position of an employee-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayState {
    None,
    CheckedIn,
    CheckedOut,
}

/// One employee's attendance for one local calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceDay {
    pub id: Uuid,
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub check_in_time: Option<DateTime<Utc>>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    /// Elapsed hours between check-in and check-out, two decimals.
    pub work_hours: Option<f64>,
    /// Check-in location.
    pub location: Option<String>,
    /// SHA-256 of the check-in device info.
    pub device_fingerprint: Option<String>,
    pub check_out_location: Option<String>,
    pub check_out_device_fingerprint: Option<String>,
    pub late_minutes: i64,
    pub early_leave_minutes: i64,
    pub check_in_confidence: Option<f32>,
    pub check_out_confidence: Option<f32>,
}

impl AttendanceDay {
    pub fn state(&self) -> DayState {
        match (self.check_in_time, self.check_out_time) {
            (_, Some(_)) => DayState::CheckedOut,
            (Some(_), None) => DayState::CheckedIn,
            (None, None) => DayState::None,
        }
    }
}

/// Client metadata captured with a punch.
#[derive(Debug, Clone, Default)]
pub struct PunchMetadata {
    pub location: Option<String>,
    pub device_info: Option<serde_json::Value>,
    /// Match score that identified the employee.
    pub confidence: Option<f32>,
}

/// Inclusive date range with an optional employee filter.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub employee_id: Option<EmployeeId>,
}

impl HistoryQuery {
    pub fn matches(&self, day: &AttendanceDay) -> bool {
        day.date >= self.from
            && day.date <= self.to
            && self.employee_id.as_ref().map_or(true, |id| id == &day.employee_id)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("attendance record already exists")]
    Conflict,
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home for attendance days. Only the ledger writes through it.
pub trait AttendanceRepository: Send + Sync {
    fn get(
        &self,
        employee_id: &EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceDay>, RepositoryError>;

    /// Insert a new day; `Conflict` if one exists for (employee, date).
    fn insert(&self, day: &AttendanceDay) -> Result<(), RepositoryError>;

    /// Write the check-out fields of an existing day; `Conflict` if the
    /// stored record is missing or already checked out.
    fn record_check_out(&self, day: &AttendanceDay) -> Result<(), RepositoryError>;

    /// Days matching `query`, date descending then employee id ascending.
    fn history(&self, query: &HistoryQuery) -> Result<Vec<AttendanceDay>, RepositoryError>;
}

/// Attendance repository held in memory.
#[derive(Debug, Default)]
pub struct MemoryAttendanceRepository {
    days: Mutex<BTreeMap<(EmployeeId, NaiveDate), AttendanceDay>>,
}

impl MemoryAttendanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.days.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttendanceRepository for MemoryAttendanceRepository {
    fn get(
        &self,
        employee_id: &EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceDay>, RepositoryError> {
        Ok(self
            .days
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(employee_id.clone(), date))
            .cloned())
    }

    fn insert(&self, day: &AttendanceDay) -> Result<(), RepositoryError> {
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (day.employee_id.clone(), day.date);
        if days.contains_key(&key) {
            return Err(RepositoryError::Conflict);
        }
        days.insert(key, day.clone());
        Ok(())
    }

    fn record_check_out(&self, day: &AttendanceDay) -> Result<(), RepositoryError> {
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        match days.get_mut(&(day.employee_id.clone(), day.date)) {
            Some(stored) if stored.check_out_time.is_none() => {
                *stored = day.clone();
                Ok(())
            }
            _ => Err(RepositoryError::Conflict),
        }
    }

    fn history(&self, query: &HistoryQuery) -> Result<Vec<AttendanceDay>, RepositoryError> {
        let days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AttendanceDay> = days.values().filter(|d| query.matches(d)).cloned().collect();
        out.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.employee_id.cmp(&b.employee_id)));
        Ok(out)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttendanceError {
    #[error("employee {0} already checked in today")]
    AlreadyCheckedIn(EmployeeId),
    #[error("employee {0} already checked out today")]
    AlreadyCheckedOut(EmployeeId),
    #[error("employee {0} has no check-in record today")]
    NoCheckInRecord(EmployeeId),
    #[error("check-out at {at} is not after check-in at {check_in}")]
    InvalidOrdering {
        check_in: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
    #[error(transparent)]
    Store(#[from] RepositoryError),
}

impl AttendanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyCheckedIn(_) => ErrorKind::AlreadyCheckedIn,
            Self::AlreadyCheckedOut(_) => ErrorKind::AlreadyCheckedOut,
            Self::NoCheckInRecord(_) => ErrorKind::NoCheckInRecord,
            Self::InvalidOrdering { .. } => ErrorKind::InvalidOrdering,
            Self::LockTimeout(_) => ErrorKind::LockTimeout,
            Self::Store(_) => ErrorKind::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// Offset used to derive the local calendar date and wall-clock time.
    pub utc_offset: FixedOffset,
    /// Longest wait for another request on the same employee-day.
    pub lock_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Owns every attendance mutation.
pub struct AttendanceLedger {
    repo: Arc<dyn AttendanceRepository>,
    policies: Arc<dyn ShiftPolicySource>,
    locks: KeyedLocks<(EmployeeId, NaiveDate)>,
    config: LedgerConfig,
}

impl AttendanceLedger {
    pub fn new(
        repo: Arc<dyn AttendanceRepository>,
        policies: Arc<dyn ShiftPolicySource>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            repo,
            policies,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Local calendar date of `at`.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.config.utc_offset).date_naive()
    }

    fn local_time(&self, at: DateTime<Utc>) -> NaiveTime {
        at.with_timezone(&self.config.utc_offset).time()
    }

    pub fn state(&self, employee_id: &EmployeeId, date: NaiveDate) -> Result<DayState, AttendanceError> {
        Ok(self
            .repo
            .get(employee_id, date)?
            .map_or(DayState::None, |d| d.state()))
    }

    pub fn day(
        &self,
        employee_id: &EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceDay>, AttendanceError> {
        Ok(self.repo.get(employee_id, date)?)
    }

    pub fn history(&self, query: &HistoryQuery) -> Result<Vec<AttendanceDay>, AttendanceError> {
        Ok(self.repo.history(query)?)
    }

    /// Open the employee's day at `at`.
    pub fn check_in(
        &self,
        employee_id: &EmployeeId,
        at: DateTime<Utc>,
        punch: PunchMetadata,
    ) -> Result<AttendanceDay, AttendanceError> {
        let date = self.local_date(at);
        let _guard = self
            .locks
            .acquire((employee_id.clone(), date), self.config.lock_timeout)?;

        if let Some(existing) = self.repo.get(employee_id, date)? {
            return Err(match existing.state() {
                DayState::CheckedOut => AttendanceError::AlreadyCheckedOut(employee_id.clone()),
                _ => AttendanceError::AlreadyCheckedIn(employee_id.clone()),
            });
        }

        let policy = self.policies.policy_for(employee_id);
        let (status, late_minutes) = match policy.classify_check_in(self.local_time(at)) {
            Arrival::OnTime => (AttendanceStatus::OnTime, 0),
            Arrival::Late { minutes } => (AttendanceStatus::Late, minutes),
        };

        let day = AttendanceDay {
            id: Uuid::new_v4(),
            employee_id: employee_id.clone(),
            date,
            check_in_time: Some(at),
            check_out_time: None,
            status,
            work_hours: None,
            location: punch.location,
            device_fingerprint: punch.device_info.as_ref().map(device_fingerprint),
            check_out_location: None,
            check_out_device_fingerprint: None,
            late_minutes,
            early_leave_minutes: 0,
            check_in_confidence: punch.confidence,
            check_out_confidence: None,
        };

        self.repo.insert(&day).map_err(|e| match e {
            RepositoryError::Conflict => AttendanceError::AlreadyCheckedIn(employee_id.clone()),
            other => AttendanceError::Store(other),
        })?;

        tracing::info!(
            employee = %employee_id,
            %date,
            status = status.as_str(),
            late_minutes,
            "checked in"
        );
        Ok(day)
    }

    /// Close the employee's day at `at`.
    pub fn check_out(
        &self,
        employee_id: &EmployeeId,
        at: DateTime<Utc>,
        punch: PunchMetadata,
    ) -> Result<AttendanceDay, AttendanceError> {
        let date = self.local_date(at);
        let _guard = self
            .locks
            .acquire((employee_id.clone(), date), self.config.lock_timeout)?;

        let existing = self
            .repo
            .get(employee_id, date)?
            .ok_or_else(|| AttendanceError::NoCheckInRecord(employee_id.clone()))?;
        let check_in = match existing.state() {
            DayState::CheckedOut => return Err(AttendanceError::AlreadyCheckedOut(employee_id.clone())),
            DayState::None => return Err(AttendanceError::NoCheckInRecord(employee_id.clone())),
            DayState::CheckedIn => existing
                .check_in_time
                .ok_or_else(|| AttendanceError::NoCheckInRecord(employee_id.clone()))?,
        };
        if at <= check_in {
            return Err(AttendanceError::InvalidOrdering { check_in, at });
        }

        let policy = self.policies.policy_for(employee_id);
        let early = policy.early_leave_minutes(self.local_time(at));

        let mut day = existing;
        day.check_out_time = Some(at);
        day.work_hours = Some(work_hours(check_in, at));
        day.check_out_location = punch.location;
        day.check_out_device_fingerprint = punch.device_info.as_ref().map(device_fingerprint);
        day.check_out_confidence = punch.confidence;
        if let Some(minutes) = early {
            day.status = AttendanceStatus::EarlyLeave;
            day.early_leave_minutes = minutes;
        }

        self.repo.record_check_out(&day).map_err(|e| match e {
            RepositoryError::Conflict => AttendanceError::AlreadyCheckedOut(employee_id.clone()),
            other => AttendanceError::Store(other),
        })?;

        tracing::info!(
            employee = %employee_id,
            %date,
            status = day.status.as_str(),
            work_hours = day.work_hours,
            "checked out"
        );
        Ok(day)
    }
}

/// Elapsed hours rounded to two decimals.
pub fn work_hours(check_in: DateTime<Utc>, check_out: DateTime<Utc>) -> f64 {
    let seconds = (check_out - check_in).num_seconds().max(0) as f64;
    (seconds / 3600.0 * 100.0).round() / 100.0
}

/// Hex SHA-256 of the canonical JSON encoding of `device_info`.
pub fn device_fingerprint(device_info: &serde_json::Value) -> String {
    format!("{:x}", Sha256::digest(device_info.to_string().as_bytes()))
}
