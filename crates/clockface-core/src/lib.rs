//! clockface-core: Face enrollment, identity matching and attendance engine.
//!
//! Enrolled embeddings live in an [`EmbeddingStore`]; the [`CosineMatcher`]
//! resolves a query against an immutable snapshot of that store; the
//! [`AttendanceLedger`] advances one employee-day at a time. The
//! [`VerificationGateway`] ties the three together for check-in/check-out.
//!
//! Everything here is synchronous. Callers that run on an async runtime are
//! expected to move engine calls onto a blocking thread.

pub mod attendance;
pub mod directory;
pub mod enrollment;
pub mod error;
pub mod extract;
pub mod gallery;
pub mod gateway;
pub mod locks;
pub mod matcher;
pub mod policy;
pub mod types;

pub use attendance::{
    AttendanceDay, AttendanceError, AttendanceLedger, AttendanceRepository, AttendanceStatus,
    DayState, HistoryQuery, LedgerConfig, MemoryAttendanceRepository, PunchMetadata,
    RepositoryError,
};
pub use directory::{CredentialIssuer, Directory, DirectoryError, MemoryDirectory};
pub use enrollment::{EnrollError, EnrollOutcome, EnrollmentConfig, EnrollmentService, Sample};
pub use error::{ErrorCategory, ErrorKind};
pub use extract::{ExtractError, Extraction, FeatureExtractor};
pub use gallery::{EmbeddingBackend, EmbeddingStore, GallerySnapshot, StoreError, StoredEmbedding};
pub use gateway::{
    Action, Clock, DailySummary, FixedClock, HistoryEntry, Identification, ReportError,
    RetryPolicy, SystemClock, VerificationGateway, Verified, VerifyError, VerifyRequest,
    VerifyResponse,
};
pub use matcher::{CosineMatcher, MatchError, MatchResult, Matcher};
pub use policy::{ShiftPolicy, ShiftPolicySource};
pub use types::{Embedding, Employee, EmployeeId};
