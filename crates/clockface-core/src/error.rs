//! Stable error taxonomy shared by every engine component.
//!
//! Component errors (`StoreError`, `EnrollError`, `AttendanceError`, ...) each
//! map onto one [`ErrorKind`]. The kind's snake_case name and message are the
//! user-facing contract; the component error's `Display` is for logs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DimensionMismatch,
    InsufficientSamples,
    InvalidOrdering,
    IdentityNotRecognized,
    AmbiguousIdentity,
    EmployeeInactive,
    EmployeeNotFound,
    FeatureExtractionFailed,
    AlreadyCheckedIn,
    AlreadyCheckedOut,
    NoCheckInRecord,
    StoreUnavailable,
    LockTimeout,
    DeadlineExceeded,
}

/// Broad class of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller error. Not retried.
    Validation,
    /// Security-relevant rejection. Audited.
    Identity,
    /// Expected outcome of concurrent or repeated use. Safe to show.
    Conflict,
    /// Store or lock trouble. Reads may be retried; writes must re-check state.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DimensionMismatch => "dimension_mismatch",
            Self::InsufficientSamples => "insufficient_samples",
            Self::InvalidOrdering => "invalid_ordering",
            Self::IdentityNotRecognized => "identity_not_recognized",
            Self::AmbiguousIdentity => "ambiguous_identity",
            Self::EmployeeInactive => "employee_inactive",
            Self::EmployeeNotFound => "employee_not_found",
            Self::FeatureExtractionFailed => "feature_extraction_failed",
            Self::AlreadyCheckedIn => "already_checked_in",
            Self::AlreadyCheckedOut => "already_checked_out",
            Self::NoCheckInRecord => "no_check_in_record",
            Self::StoreUnavailable => "store_unavailable",
            Self::LockTimeout => "lock_timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::DimensionMismatch | Self::InsufficientSamples | Self::InvalidOrdering => {
                ErrorCategory::Validation
            }
            Self::IdentityNotRecognized
            | Self::AmbiguousIdentity
            | Self::EmployeeInactive
            | Self::EmployeeNotFound
            | Self::FeatureExtractionFailed => ErrorCategory::Identity,
            Self::AlreadyCheckedIn | Self::AlreadyCheckedOut | Self::NoCheckInRecord => {
                ErrorCategory::Conflict
            }
            Self::StoreUnavailable | Self::LockTimeout | Self::DeadlineExceeded => {
                ErrorCategory::Infrastructure
            }
        }
    }

    /// Human message safe to show to the person at the camera.
    pub fn message(self) -> &'static str {
        match self {
            Self::DimensionMismatch => "Face data has an unexpected format",
            Self::InsufficientSamples => "Not enough good-quality face images",
            Self::InvalidOrdering => "Check-out time must be after check-in time",
            Self::IdentityNotRecognized => "Face not recognized",
            Self::AmbiguousIdentity => "Face matches an already enrolled employee",
            Self::EmployeeInactive => "Employee is not active",
            Self::EmployeeNotFound => "Employee not found",
            Self::FeatureExtractionFailed => "No usable face found in the image",
            Self::AlreadyCheckedIn => "Already checked in",
            Self::AlreadyCheckedOut => "Already checked out",
            Self::NoCheckInRecord => "No check-in record found",
            Self::StoreUnavailable => "Attendance service is temporarily unavailable",
            Self::LockTimeout => "Attendance service is busy, please try again",
            Self::DeadlineExceeded => "Request took too long, please try again",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
