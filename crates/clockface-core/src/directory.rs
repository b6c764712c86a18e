//! Organizational directory and credential issuance seams.

use crate::types::{Employee, EmployeeId};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the employee directory.
pub trait Directory: Send + Sync {
    fn employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>, DirectoryError>;

    /// Number of active employees.
    fn active_count(&self) -> Result<usize, DirectoryError>;

    fn is_active(&self, employee_id: &EmployeeId) -> Result<bool, DirectoryError> {
        Ok(self.employee(employee_id)?.is_some_and(|e| e.is_active))
    }
}

/// Notified after a successful enrollment. Fire-and-forget: the engine
/// never waits on or inspects the outcome.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, employee_id: &EmployeeId);
}

/// Directory held in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    employees: RwLock<BTreeMap<EmployeeId, Employee>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, employee: Employee) {
        self.employees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(employee.employee_id.clone(), employee);
    }

    /// Returns `false` if the employee is unknown.
    pub fn set_active(&self, employee_id: &EmployeeId, active: bool) -> bool {
        match self
            .employees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(employee_id)
        {
            Some(e) => {
                e.is_active = active;
                true
            }
            None => false,
        }
    }
}

impl Directory for MemoryDirectory {
    fn employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>, DirectoryError> {
        Ok(self
            .employees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(employee_id)
            .cloned())
    }

    fn active_count(&self) -> Result<usize, DirectoryError> {
        Ok(self
            .employees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.is_active)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee(code: &str, active: bool) -> Employee {
        Employee {
            employee_id: EmployeeId::from(code),
            full_name: format!("Employee {code}"),
            email: format!("{code}@example.com"),
            phone: None,
            is_active: active,
        }
    }

    #[test]
    fn test_is_active() {
        let dir = MemoryDirectory::new();
        dir.upsert(employee("a", true));
        dir.upsert(employee("b", false));
        assert!(dir.is_active(&EmployeeId::from("a")).unwrap());
        assert!(!dir.is_active(&EmployeeId::from("b")).unwrap());
        assert!(!dir.is_active(&EmployeeId::from("ghost")).unwrap());
        assert_eq!(dir.active_count().unwrap(), 1);
    }

    #[test]
    fn test_set_active() {
        let dir = MemoryDirectory::new();
        dir.upsert(employee("a", true));
        assert!(dir.set_active(&EmployeeId::from("a"), false));
        assert!(!dir.set_active(&EmployeeId::from("ghost"), false));
        assert_eq!(dir.active_count().unwrap(), 0);
    }
}
