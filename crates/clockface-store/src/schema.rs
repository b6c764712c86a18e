pub(crate) const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS employees (
    employee_id TEXT PRIMARY KEY,
    full_name   TEXT NOT NULL,
    email       TEXT NOT NULL UNIQUE,
    phone       TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    seq           INTEGER PRIMARY KEY,
    employee_id   TEXT NOT NULL REFERENCES employees(employee_id),
    quality       REAL NOT NULL,
    dimension     INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    nonce         BLOB,
    model_version TEXT,
    enrolled_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_employee
    ON face_embeddings(employee_id);

CREATE TABLE IF NOT EXISTS attendance_days (
    id                           TEXT PRIMARY KEY,
    employee_id                  TEXT NOT NULL REFERENCES employees(employee_id),
    work_date                    TEXT NOT NULL,
    check_in_time                TEXT,
    check_out_time               TEXT,
    status                       TEXT NOT NULL,
    work_hours                   REAL,
    location                     TEXT,
    device_fingerprint           TEXT,
    check_out_location           TEXT,
    check_out_device_fingerprint TEXT,
    late_minutes                 INTEGER NOT NULL DEFAULT 0,
    early_leave_minutes          INTEGER NOT NULL DEFAULT 0,
    check_in_confidence          REAL,
    check_out_confidence         REAL,
    UNIQUE (employee_id, work_date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_days_date
    ON attendance_days(work_date);
";
