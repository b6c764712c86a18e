//! Attendance days. `UNIQUE(employee_id, work_date)` backs insert-once
//! check-in; check-out only writes a row whose `check_out_time IS NULL`.

use crate::{conversion_error, format_ts, is_unique_violation, parse_ts, Database, DbError};
use chrono::NaiveDate;
use clockface_core::{
    AttendanceDay, AttendanceRepository, AttendanceStatus, EmployeeId, HistoryQuery,
    RepositoryError,
};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

const DAY_COLUMNS: &str = "id, employee_id, work_date, check_in_time, check_out_time, status,
    work_hours, location, device_fingerprint, check_out_location, check_out_device_fingerprint,
    late_minutes, early_leave_minutes, check_in_confidence, check_out_confidence";

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn decode_day(row: &Row<'_>) -> rusqlite::Result<AttendanceDay> {
    let id: String = row.get(0)?;
    let date: String = row.get(2)?;
    let check_in: Option<String> = row.get(3)?;
    let check_out: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let check_in_confidence: Option<f64> = row.get(13)?;
    let check_out_confidence: Option<f64> = row.get(14)?;

    Ok(AttendanceDay {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        employee_id: EmployeeId::new(row.get::<_, String>(1)?),
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| conversion_error(2, e))?,
        check_in_time: check_in.as_deref().map(|t| parse_ts(3, t)).transpose()?,
        check_out_time: check_out.as_deref().map(|t| parse_ts(4, t)).transpose()?,
        status: status
            .parse::<AttendanceStatus>()
            .map_err(|e| conversion_error(5, e))?,
        work_hours: row.get(6)?,
        location: row.get(7)?,
        device_fingerprint: row.get(8)?,
        check_out_location: row.get(9)?,
        check_out_device_fingerprint: row.get(10)?,
        late_minutes: row.get(11)?,
        early_leave_minutes: row.get(12)?,
        check_in_confidence: check_in_confidence.map(|c| c as f32),
        check_out_confidence: check_out_confidence.map(|c| c as f32),
    })
}

impl AttendanceRepository for Database {
    fn get(
        &self,
        employee_id: &EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceDay>, RepositoryError> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {DAY_COLUMNS} FROM attendance_days
                     WHERE employee_id = ?1 AND work_date = ?2"
                ),
                params![employee_id.as_str(), format_date(date)],
                decode_day,
            )
            .optional()
            .map_err(|e| DbError::from(e).into())
    }

    fn insert(&self, day: &AttendanceDay) -> Result<(), RepositoryError> {
        let inserted = self.conn().execute(
            &format!(
                "INSERT INTO attendance_days ({DAY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                day.id.to_string(),
                day.employee_id.as_str(),
                format_date(day.date),
                day.check_in_time.map(format_ts),
                day.check_out_time.map(format_ts),
                day.status.as_str(),
                day.work_hours,
                day.location,
                day.device_fingerprint,
                day.check_out_location,
                day.check_out_device_fingerprint,
                day.late_minutes,
                day.early_leave_minutes,
                day.check_in_confidence.map(f64::from),
                day.check_out_confidence.map(f64::from),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict),
            Err(e) => Err(DbError::from(e).into()),
        }
    }

    fn record_check_out(&self, day: &AttendanceDay) -> Result<(), RepositoryError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE attendance_days SET
                    check_out_time = ?3,
                    status = ?4,
                    work_hours = ?5,
                    check_out_location = ?6,
                    check_out_device_fingerprint = ?7,
                    early_leave_minutes = ?8,
                    check_out_confidence = ?9
                 WHERE employee_id = ?1 AND work_date = ?2
                   AND check_in_time IS NOT NULL
                   AND check_out_time IS NULL",
                params![
                    day.employee_id.as_str(),
                    format_date(day.date),
                    day.check_out_time.map(format_ts),
                    day.status.as_str(),
                    day.work_hours,
                    day.check_out_location,
                    day.check_out_device_fingerprint,
                    day.early_leave_minutes,
                    day.check_out_confidence.map(f64::from),
                ],
            )
            .map_err(DbError::from)?;
        if updated == 0 {
            return Err(RepositoryError::Conflict);
        }
        Ok(())
    }

    fn history(&self, query: &HistoryQuery) -> Result<Vec<AttendanceDay>, RepositoryError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DAY_COLUMNS} FROM attendance_days
                 WHERE work_date BETWEEN ?1 AND ?2
                   AND (?3 IS NULL OR employee_id = ?3)
                 ORDER BY work_date DESC, employee_id ASC"
            ))
            .map_err(DbError::from)?;
        let rows = stmt
            .query_map(
                params![
                    format_date(query.from),
                    format_date(query.to),
                    query.employee_id.as_ref().map(EmployeeId::as_str),
                ],
                decode_day,
            )
            .map_err(DbError::from)?;
        let days = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)?;
        Ok(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::employee;
    use chrono::{DateTime, TimeZone, Utc};
    use clockface_core::{
        AttendanceError, AttendanceLedger, LedgerConfig, PunchMetadata, ShiftPolicy,
    };
    use std::sync::{Arc, Barrier};

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn ledger(db: Arc<Database>) -> AttendanceLedger {
        AttendanceLedger::new(db, Arc::new(ShiftPolicy::default()), LedgerConfig::default())
    }

    fn db_with(codes: &[&str]) -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        for code in codes {
            db.register_employee(&employee(code)).unwrap();
        }
        Arc::new(db)
    }

    #[test]
    fn test_day_persists_every_field() {
        let db = db_with(&["E001"]);
        let ledger = ledger(db.clone());
        let id = EmployeeId::from("E001");
        let punch = PunchMetadata {
            location: Some("gate 2".into()),
            device_info: Some(serde_json::json!({"kiosk": "lobby-1"})),
            confidence: Some(0.87),
        };
        let checked_in = ledger.check_in(&id, at(2, 9, 25), punch.clone()).unwrap();
        let checked_out = ledger.check_out(&id, at(2, 16, 30), punch).unwrap();

        let stored = db.get(&id, at(2, 0, 0).date_naive()).unwrap().unwrap();
        assert_eq!(stored, checked_out);
        assert_eq!(stored.id, checked_in.id);
        assert_eq!(stored.status, AttendanceStatus::EarlyLeave);
        assert_eq!(stored.late_minutes, 25);
        assert_eq!(stored.early_leave_minutes, 30);
        assert_eq!(stored.work_hours, Some(7.08));
        assert_eq!(stored.check_in_confidence, Some(0.87));
    }

    #[test]
    fn test_unique_key_refuses_second_insert() {
        let db = db_with(&["E001"]);
        let ledger = ledger(db.clone());
        let id = EmployeeId::from("E001");
        let day = ledger.check_in(&id, at(2, 8, 0), PunchMetadata::default()).unwrap();

        let mut dup = day.clone();
        dup.id = Uuid::new_v4();
        assert_eq!(db.insert(&dup), Err(RepositoryError::Conflict));
    }

    #[test]
    fn test_check_out_written_once() {
        let db = db_with(&["E001"]);
        let ledger = ledger(db.clone());
        let id = EmployeeId::from("E001");
        ledger.check_in(&id, at(2, 8, 0), PunchMetadata::default()).unwrap();
        let out = ledger.check_out(&id, at(2, 17, 0), PunchMetadata::default()).unwrap();

        assert_eq!(db.record_check_out(&out), Err(RepositoryError::Conflict));
        assert!(matches!(
            ledger.check_out(&id, at(2, 18, 0), PunchMetadata::default()),
            Err(AttendanceError::AlreadyCheckedOut(_))
        ));
    }

    #[test]
    fn test_concurrent_check_ins_over_sqlite() {
        let db = db_with(&["E001"]);
        let ledger = ledger(db.clone());
        let id = EmployeeId::from("E001");
        let barrier = Barrier::new(8);

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        ledger.check_in(&id, at(2, 9, 0), PunchMetadata::default())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AttendanceError::AlreadyCheckedIn(_))));
    }

    #[test]
    fn test_history_range_filter_and_order() {
        let db = db_with(&["E001", "E002"]);
        let ledger = ledger(db.clone());
        let (a, b) = (EmployeeId::from("E001"), EmployeeId::from("E002"));
        for day in [2, 3, 4] {
            ledger.check_in(&b, at(day, 9, 0), PunchMetadata::default()).unwrap();
            ledger.check_in(&a, at(day, 9, 5), PunchMetadata::default()).unwrap();
        }

        let all = db
            .history(&HistoryQuery {
                from: at(3, 0, 0).date_naive(),
                to: at(4, 0, 0).date_naive(),
                employee_id: None,
            })
            .unwrap();
        let keys: Vec<_> = all
            .iter()
            .map(|d| (d.date.format("%d").to_string(), d.employee_id.as_str().to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("04".to_string(), "E001".to_string()),
                ("04".to_string(), "E002".to_string()),
                ("03".to_string(), "E001".to_string()),
                ("03".to_string(), "E002".to_string()),
            ]
        );

        let only_b = db
            .history(&HistoryQuery {
                from: at(1, 0, 0).date_naive(),
                to: at(9, 0, 0).date_naive(),
                employee_id: Some(b.clone()),
            })
            .unwrap();
        assert_eq!(only_b.len(), 3);
        assert!(only_b.iter().all(|d| d.employee_id == b));
    }
}
