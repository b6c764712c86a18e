//! Verification gateway: capture in, attendance transition out.
//!
//! Receipt time is read once from the gateway [`Clock`] and is the only
//! timestamp the ledger ever sees. A client-supplied timestamp is advisory:
//! it is logged and its skew reported, nothing more.

use crate::attendance::{
    AttendanceDay, AttendanceError, AttendanceLedger, AttendanceStatus, HistoryQuery,
    PunchMetadata,
};
use crate::directory::{Directory, DirectoryError};
use crate::error::ErrorKind;
use crate::extract::{ExtractError, FeatureExtractor};
use crate::gallery::EmbeddingStore;
use crate::matcher::{MatchError, MatchResult, Matcher};
use crate::types::{Employee, EmployeeId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

const AUDIT: &str = "clockface::audit";

/// Source of the authoritative receipt time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backoff for idempotent reads at the gateway boundary. Writes are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    fn run<T, E: std::fmt::Display>(&self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(attempt, error = %e, ?backoff, "read failed, retrying");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CheckIn,
    CheckOut,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "check_in" | "check-in" | "checkin" => Ok(Self::CheckIn),
            "check_out" | "check-out" | "checkout" => Ok(Self::CheckOut),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub capture: Vec<u8>,
    pub action: Action,
    pub location: Option<String>,
    pub device_info: Option<serde_json::Value>,
    /// Advisory only.
    pub client_timestamp: Option<DateTime<Utc>>,
}

/// Response contract for check-in/check-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub action: Action,
    pub employee_id: Option<EmployeeId>,
    pub employee_name: Option<String>,
    pub check_in_time: Option<DateTime<Utc>>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub work_hours: Option<f64>,
    pub status: Option<AttendanceStatus>,
    pub message: String,
    pub error_kind: Option<ErrorKind>,
    /// Client timestamp minus receipt time, when the client sent one.
    pub client_skew_seconds: Option<i64>,
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("feature extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("identity not recognized (best score {score:.3})")]
    IdentityNotRecognized { score: f32 },
    #[error("employee {0} not found in directory")]
    EmployeeNotFound(EmployeeId),
    #[error("employee {0} is not active")]
    EmployeeInactive(EmployeeId),
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("deadline exceeded before attendance update")]
    DeadlineExceeded,
    #[error("{source}")]
    Attendance {
        employee: Employee,
        #[source]
        source: AttendanceError,
    },
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Extraction(_) => ErrorKind::FeatureExtractionFailed,
            Self::Match(MatchError::DimensionMismatch { .. }) => ErrorKind::DimensionMismatch,
            Self::IdentityNotRecognized { .. } => ErrorKind::IdentityNotRecognized,
            Self::EmployeeNotFound(_) => ErrorKind::EmployeeNotFound,
            Self::EmployeeInactive(_) => ErrorKind::EmployeeInactive,
            Self::Directory(_) => ErrorKind::StoreUnavailable,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Attendance { source, .. } => source.kind(),
        }
    }
}

/// Who a capture resolves to, without touching attendance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub employee_id: EmployeeId,
    pub employee_name: String,
    pub score: f32,
    pub runner_up_score: f32,
}

/// A committed transition.
#[derive(Debug, Clone)]
pub struct Verified {
    pub employee: Employee,
    pub day: AttendanceDay,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),
}

impl ReportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Attendance(e) => e.kind(),
            Self::Directory(_) => ErrorKind::StoreUnavailable,
        }
    }
}

/// History row with the employee's display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub day: AttendanceDay,
    pub employee_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_employees: usize,
    pub checked_in: usize,
    pub checked_out: usize,
    pub absent: usize,
}

pub struct VerificationGateway {
    extractor: Arc<dyn FeatureExtractor>,
    store: Arc<EmbeddingStore>,
    matcher: Arc<dyn Matcher>,
    ledger: Arc<AttendanceLedger>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl VerificationGateway {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        store: Arc<EmbeddingStore>,
        matcher: Arc<dyn Matcher>,
        ledger: Arc<AttendanceLedger>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            extractor,
            store,
            matcher,
            ledger,
            directory,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn verify(&self, request: VerifyRequest) -> VerifyResponse {
        self.verify_until(request, None)
    }

    /// Verify, giving up before the attendance transition if `deadline` has passed.
    pub fn verify_until(&self, request: VerifyRequest, deadline: Option<Instant>) -> VerifyResponse {
        let received_at = self.clock.now();
        let action = request.action;
        let client_skew_seconds = request
            .client_timestamp
            .map(|client| (client - received_at).num_seconds());
        if let Some(skew) = client_skew_seconds {
            tracing::debug!(skew_seconds = skew, "client timestamp is advisory; using receipt time");
        }

        match self.try_verify(request, received_at, deadline) {
            Ok(v) => VerifyResponse {
                success: true,
                action,
                employee_id: Some(v.employee.employee_id.clone()),
                employee_name: Some(v.employee.full_name.clone()),
                check_in_time: v.day.check_in_time,
                check_out_time: v.day.check_out_time,
                work_hours: v.day.work_hours,
                status: Some(v.day.status),
                message: match action {
                    Action::CheckIn => "Check-in successful".to_string(),
                    Action::CheckOut => "Check-out successful".to_string(),
                },
                error_kind: None,
                client_skew_seconds,
            },
            Err(err) => {
                let kind = err.kind();
                let employee = match &err {
                    VerifyError::Attendance { employee, .. } => Some(employee),
                    _ => None,
                };
                VerifyResponse {
                    success: false,
                    action,
                    employee_id: employee.map(|e| e.employee_id.clone()),
                    employee_name: employee.map(|e| e.full_name.clone()),
                    check_in_time: None,
                    check_out_time: None,
                    work_hours: None,
                    status: None,
                    message: kind.message().to_string(),
                    error_kind: Some(kind),
                    client_skew_seconds,
                }
            }
        }
    }

    /// Resolve a capture to an active employee. Attendance is not touched.
    pub fn identify(&self, capture: &[u8]) -> Result<Identification, VerifyError> {
        let (employee, result) = self.resolve(capture, None)?;
        Ok(Identification {
            employee_id: employee.employee_id,
            employee_name: employee.full_name,
            score: result.score,
            runner_up_score: result.runner_up_score,
        })
    }

    fn resolve(
        &self,
        capture: &[u8],
        action: Option<Action>,
    ) -> Result<(Employee, MatchResult), VerifyError> {
        let query = self.extractor.extract(capture).map_err(|e| {
            tracing::warn!(target: AUDIT, ?action, error = %e, "verify: extraction failed");
            VerifyError::Extraction(e)
        })?;

        let snapshot = self.store.snapshot();
        let result = self.matcher.find(&query.embedding, &snapshot, None)?;
        let employee_id = match &result.employee_id {
            Some(id) if result.accepted => id.clone(),
            _ => {
                tracing::warn!(
                    target: AUDIT,
                    ?action,
                    score = result.score,
                    runner_up = result.runner_up_score,
                    gallery = snapshot.employee_count(),
                    "verify: identity not recognized"
                );
                return Err(VerifyError::IdentityNotRecognized {
                    score: result.score,
                });
            }
        };

        let employee = self
            .retry
            .run(|| self.directory.employee(&employee_id))?
            .ok_or_else(|| VerifyError::EmployeeNotFound(employee_id.clone()))?;
        if !employee.is_active {
            tracing::warn!(target: AUDIT, employee = %employee_id, ?action, "verify: inactive employee");
            return Err(VerifyError::EmployeeInactive(employee_id));
        }
        Ok((employee, result))
    }

    /// Resolve the capture to an employee and apply `request.action` at `received_at`.
    pub fn try_verify(
        &self,
        request: VerifyRequest,
        received_at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<Verified, VerifyError> {
        let (employee, result) = self.resolve(&request.capture, Some(request.action))?;
        let employee_id = employee.employee_id.clone();

        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!(employee = %employee_id, "verify: deadline passed before transition");
            return Err(VerifyError::DeadlineExceeded);
        }

        let punch = PunchMetadata {
            location: request.location,
            device_info: request.device_info,
            confidence: Some(result.score),
        };
        let applied = match request.action {
            Action::CheckIn => self.ledger.check_in(&employee_id, received_at, punch),
            Action::CheckOut => self.ledger.check_out(&employee_id, received_at, punch),
        };
        match applied {
            Ok(day) => Ok(Verified { employee, day }),
            Err(source) => {
                tracing::info!(employee = %employee_id, error = %source, "verify: transition refused");
                Err(VerifyError::Attendance { employee, source })
            }
        }
    }

    /// Attendance days with employee names, ordered as the ledger orders them.
    pub fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryEntry>, ReportError> {
        let days = self.retry.run(|| self.ledger.history(query))?;
        let mut names: BTreeMap<EmployeeId, Option<String>> = BTreeMap::new();
        let mut out = Vec::with_capacity(days.len());
        for day in days {
            let name = match names.get(&day.employee_id) {
                Some(n) => n.clone(),
                None => {
                    let n = self
                        .retry
                        .run(|| self.directory.employee(&day.employee_id))?
                        .map(|e| e.full_name);
                    names.insert(day.employee_id.clone(), n.clone());
                    n
                }
            };
            out.push(HistoryEntry {
                day,
                employee_name: name,
            });
        }
        Ok(out)
    }

    /// Local calendar date at the gateway clock's current time.
    pub fn today(&self) -> NaiveDate {
        self.ledger.local_date(self.clock.now())
    }

    /// Attendance counts for `date`, or for today's local date.
    pub fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, ReportError> {
        let date = date.unwrap_or_else(|| self.today());
        let total_employees = self.retry.run(|| self.directory.active_count())?;
        let days = self.retry.run(|| {
            self.ledger.history(&HistoryQuery {
                from: date,
                to: date,
                employee_id: None,
            })
        })?;
        let checked_in = days.iter().filter(|d| d.check_in_time.is_some()).count();
        let checked_out = days.iter().filter(|d| d.check_out_time.is_some()).count();
        Ok(DailySummary {
            date,
            total_employees,
            checked_in,
            checked_out,
            absent: total_employees.saturating_sub(checked_in),
        })
    }
}
