use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, NaiveDate, Utc};
use clockface_core::{
    Action, Employee, EmployeeId, EnrollOutcome, ErrorCategory, HistoryQuery, Identification,
    VerifyRequest,
};
use clockface_store::DbError;
use serde_json::{json, Value};
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.clockface.Attendance1";
pub const OBJECT_PATH: &str = "/org/clockface/Attendance1";

/// D-Bus interface for the clockface attendance daemon.
///
/// Bus name: org.clockface.Attendance1
/// Object path: /org/clockface/Attendance1
///
/// Every method returns a JSON document. Optional string arguments are
/// passed as `""` when absent. Refusals the caller can act on (unknown
/// face, already checked in, too few good samples) are reported in the
/// JSON with an `error_kind`; D-Bus errors mean the request itself was
/// malformed or the daemon could not serve it.
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.clockface.Attendance1")]
impl AttendanceService {
    /// Add an employee to the directory.
    async fn register_employee(
        &self,
        employee_id: &str,
        full_name: &str,
        email: &str,
        phone: &str,
    ) -> fdo::Result<String> {
        let employee = Employee {
            employee_id: required_id(employee_id)?,
            full_name: required("full_name", full_name)?.to_string(),
            email: required("email", email)?.to_string(),
            phone: optional(phone).map(str::to_string),
            is_active: true,
        };
        tracing::info!(employee = %employee.employee_id, "register requested");
        self.engine
            .register_employee(employee.clone())
            .await
            .map_err(to_fdo)?;
        to_json(&employee)
    }

    /// Mark an employee inactive and drop their enrolled embeddings.
    async fn deactivate_employee(&self, employee_id: &str) -> fdo::Result<bool> {
        let id = required_id(employee_id)?;
        tracing::info!(employee = %id, "deactivate requested");
        self.engine.set_active(id, false).await.map_err(to_fdo)
    }

    /// Directory listing with the number of enrolled embeddings per
    /// employee. Inactive employees are included unless `active_only`.
    async fn list_employees(&self, active_only: bool) -> fdo::Result<String> {
        let entries = self.engine.list_employees(active_only).await.map_err(to_fdo)?;
        to_json(&entries)
    }

    /// Enroll face captures (encoded images) for an employee.
    async fn enroll(&self, employee_id: &str, captures: Vec<Vec<u8>>) -> fdo::Result<String> {
        let id = required_id(employee_id)?;
        tracing::info!(employee = %id, captures = captures.len(), "enroll requested");
        let reply = enroll_reply(self.engine.enroll(id, captures).await)?;
        Ok(reply.to_string())
    }

    /// Identify the face in `capture` and record a check-in or check-out.
    async fn verify(
        &self,
        action: &str,
        capture: Vec<u8>,
        location: &str,
        device_info: &str,
        client_timestamp: &str,
    ) -> fdo::Result<String> {
        let request = verify_request(action, capture, location, device_info, client_timestamp)?;
        tracing::info!(action = ?request.action, "verify requested");
        let response = self.engine.verify(request).await.map_err(to_fdo)?;
        to_json(&response)
    }

    /// Identify the face in `capture` without touching attendance.
    async fn identify(&self, capture: Vec<u8>) -> fdo::Result<String> {
        tracing::info!("identify requested");
        let reply = identify_reply(self.engine.identify(capture).await)?;
        Ok(reply.to_string())
    }

    /// Attendance days between `from` and `to` (inclusive, `YYYY-MM-DD`),
    /// newest first, optionally for one employee.
    async fn history(&self, from: &str, to: &str, employee_id: &str) -> fdo::Result<String> {
        let query = history_query(from, to, employee_id)?;
        let entries = self.engine.history(query).await.map_err(to_fdo)?;
        to_json(&entries)
    }

    /// Counts for one local date, today when `date` is empty.
    async fn today_status(&self, date: &str) -> fdo::Result<String> {
        let date = parse_date("date", date)?;
        let summary = self.engine.daily_summary(date).await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        let today = self.engine.today().await.map_err(to_fdo)?;
        Ok(json!({
            "version": status.version,
            "model_version": status.model_version,
            "embedding_dim": status.embedding_dim,
            "enrolled_employees": status.enrolled_employees,
            "embeddings": status.embeddings,
            "active_employees": status.active_employees,
            "similarity_threshold": status.similarity_threshold,
            "min_margin": status.min_margin,
            "workers": status.workers,
            "today": today,
        })
        .to_string())
    }
}

fn optional(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn required<'a>(name: &str, value: &'a str) -> fdo::Result<&'a str> {
    optional(value).ok_or_else(|| fdo::Error::InvalidArgs(format!("{name} must not be empty")))
}

fn required_id(value: &str) -> fdo::Result<EmployeeId> {
    required("employee_id", value).map(EmployeeId::from)
}

fn parse_date(name: &str, value: &str) -> fdo::Result<Option<NaiveDate>> {
    optional(value)
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|e| fdo::Error::InvalidArgs(format!("{name}: {e}")))
        })
        .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match &err {
        EngineError::Database(DbError::DuplicateEmployee(_)) => fdo::Error::InvalidArgs(err.to_string()),
        _ => {
            tracing::warn!(error = %err, "request failed");
            fdo::Error::Failed(err.to_string())
        }
    }
}

fn verify_request(
    action: &str,
    capture: Vec<u8>,
    location: &str,
    device_info: &str,
    client_timestamp: &str,
) -> fdo::Result<VerifyRequest> {
    let action: Action = action.parse().map_err(fdo::Error::InvalidArgs)?;
    let device_info = optional(device_info)
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .map_err(|e| fdo::Error::InvalidArgs(format!("device_info: {e}")))
        })
        .transpose()?;
    let client_timestamp = optional(client_timestamp)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| fdo::Error::InvalidArgs(format!("client_timestamp: {e}")))
        })
        .transpose()?;
    Ok(VerifyRequest {
        capture,
        action,
        location: optional(location).map(str::to_string),
        device_info,
        client_timestamp,
    })
}

fn history_query(from: &str, to: &str, employee_id: &str) -> fdo::Result<HistoryQuery> {
    let from = match parse_date("from", from)? {
        Some(d) => d,
        None => bound(1, 1, 1)?,
    };
    let to = match parse_date("to", to)? {
        Some(d) => d,
        None => bound(9999, 12, 31)?,
    };
    if from > to {
        return Err(fdo::Error::InvalidArgs("from is after to".into()));
    }
    Ok(HistoryQuery {
        from,
        to,
        employee_id: optional(employee_id).map(EmployeeId::from),
    })
}

/// Open range ends. Dates are stored as `YYYY-MM-DD` text, so the
/// bounds stay within four-digit years.
fn bound(year: i32, month: u32, day: u32) -> fdo::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| fdo::Error::Failed(format!("invalid date bound {year}-{month}-{day}")))
}

/// Refusals become a JSON body; only infrastructure failures become D-Bus errors.
fn enroll_reply(result: Result<EnrollOutcome, EngineError>) -> fdo::Result<Value> {
    match result {
        Ok(outcome) => Ok(json!({
            "accepted": true,
            "employee_id": outcome.employee_id,
            "accepted_samples": outcome.accepted_samples,
            "rejected_samples": outcome.rejected_samples,
        })),
        Err(err) => match err.kind() {
            Some(kind) if kind.category() != ErrorCategory::Infrastructure => Ok(json!({
                "accepted": false,
                "error_kind": kind,
                "message": kind.message(),
                "rejected_reason": err.to_string(),
            })),
            _ => Err(to_fdo(err)),
        },
    }
}

fn identify_reply(result: Result<Identification, EngineError>) -> fdo::Result<Value> {
    match result {
        Ok(id) => Ok(json!({
            "recognized": true,
            "employee_id": id.employee_id,
            "employee_name": id.employee_name,
            "score": id.score,
            "runner_up_score": id.runner_up_score,
        })),
        Err(err) => match err.kind() {
            Some(kind) if kind.category() != ErrorCategory::Infrastructure => Ok(json!({
                "recognized": false,
                "error_kind": kind,
                "message": kind.message(),
            })),
            _ => Err(to_fdo(err)),
        },
    }
}
