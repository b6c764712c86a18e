use clockface_core::{Employee, EmployeeId};

pub(crate) fn employee(code: &str) -> Employee {
    Employee {
        employee_id: EmployeeId::from(code),
        full_name: format!("Employee {code}"),
        email: format!("{}@example.com", code.to_lowercase()),
        phone: Some("+62 812 0000".into()),
        is_active: true,
    }
}
