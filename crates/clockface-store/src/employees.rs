//! Employee directory table.

use crate::{format_ts, is_unique_violation, Database, DbError, Result};
use chrono::Utc;
use clockface_core::{Directory, DirectoryError, Employee, EmployeeId};
use rusqlite::{params, OptionalExtension, Row};

const EMPLOYEE_COLUMNS: &str = "employee_id, full_name, email, phone, is_active";

fn decode_employee(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        employee_id: EmployeeId::new(row.get::<_, String>(0)?),
        full_name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        is_active: row.get(4)?,
    })
}

impl Database {
    /// Add an employee. Fails with [`DbError::DuplicateEmployee`] if the id
    /// or the email is already taken.
    pub fn register_employee(&self, employee: &Employee) -> Result<()> {
        let now = format_ts(Utc::now());
        let inserted = self.conn().execute(
            "INSERT INTO employees (employee_id, full_name, email, phone, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                employee.employee_id.as_str(),
                employee.full_name,
                employee.email,
                employee.phone,
                employee.is_active,
                now
            ],
        );
        match inserted {
            Ok(_) => {
                tracing::info!(employee = %employee.employee_id, "employee registered");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                Err(DbError::DuplicateEmployee(employee.employee_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false if no such employee exists.
    pub fn set_active(&self, employee_id: &EmployeeId, active: bool) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE employees SET is_active = ?2, updated_at = ?3 WHERE employee_id = ?1",
            params![employee_id.as_str(), active, format_ts(Utc::now())],
        )?;
        if updated > 0 {
            tracing::info!(employee = %employee_id, active, "employee activation changed");
        }
        Ok(updated > 0)
    }

    pub fn find_employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE employee_id = ?1"),
                params![employee_id.as_str()],
                decode_employee,
            )
            .optional()?)
    }

    /// Employees ordered by id.
    pub fn list_employees(&self, active_only: bool) -> Result<Vec<Employee>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMPLOYEE_COLUMNS} FROM employees
             WHERE (?1 = 0 OR is_active = 1)
             ORDER BY employee_id"
        ))?;
        let rows = stmt.query_map(params![active_only], decode_employee)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl Directory for Database {
    fn employee(&self, employee_id: &EmployeeId) -> std::result::Result<Option<Employee>, DirectoryError> {
        Ok(self.find_employee(employee_id)?)
    }

    fn active_count(&self) -> std::result::Result<usize, DirectoryError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM employees WHERE is_active = 1", [], |row| {
                row.get(0)
            })
            .map_err(DbError::from)?;
        usize::try_from(count)
            .map_err(|_| DbError::InvalidDbValue(format!("negative employee count {count}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::employee;

    #[test]
    fn test_register_and_lookup() {
        let db = Database::open_in_memory().unwrap();
        db.register_employee(&employee("E001")).unwrap();

        let found = db.employee(&EmployeeId::from("E001")).unwrap().unwrap();
        assert_eq!(found, employee("E001"));
        assert!(db.employee(&EmployeeId::from("E999")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_id_or_email_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.register_employee(&employee("E001")).unwrap();

        let err = db.register_employee(&employee("E001")).unwrap_err();
        assert!(matches!(err, DbError::DuplicateEmployee(_)));

        let mut same_email = employee("E002");
        same_email.email = "e001@example.com".into();
        assert!(matches!(
            db.register_employee(&same_email),
            Err(DbError::DuplicateEmployee(_))
        ));
    }

    #[test]
    fn test_deactivate_changes_active_count() {
        let db = Database::open_in_memory().unwrap();
        for code in ["E001", "E002", "E003"] {
            db.register_employee(&employee(code)).unwrap();
        }
        assert_eq!(db.active_count().unwrap(), 3);

        assert!(db.set_active(&EmployeeId::from("E002"), false).unwrap());
        assert!(!db.set_active(&EmployeeId::from("E404"), false).unwrap());
        assert_eq!(db.active_count().unwrap(), 2);
        assert!(!db.is_active(&EmployeeId::from("E002")).unwrap());

        let active: Vec<_> = db
            .list_employees(true)
            .unwrap()
            .into_iter()
            .map(|e| e.employee_id)
            .collect();
        assert_eq!(active, vec![EmployeeId::from("E001"), EmployeeId::from("E003")]);
        assert_eq!(db.list_employees(false).unwrap().len(), 3);
    }
}
