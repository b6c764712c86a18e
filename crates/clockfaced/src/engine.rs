use crate::config::{Config, ConfigError};
use chrono::NaiveDate;
use clockface_core::{
    AttendanceLedger, CosineMatcher, CredentialIssuer, DailySummary, Directory, EmbeddingStore,
    Employee, EmployeeId, EnrollError, EnrollOutcome, EnrollmentConfig, EnrollmentService,
    ErrorKind, FeatureExtractor, HistoryEntry, HistoryQuery, Identification, LedgerConfig,
    ReportError, StoreError, VerificationGateway, VerifyError, VerifyRequest, VerifyResponse,
};
use clockface_store::{Database, DbError, EmbeddingCipher};
use clockface_vision::{HistogramExtractor, MODEL_VERSION};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("embedding store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Identify(#[from] VerifyError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("extractor produces {actual}-dimensional embeddings, store is configured for {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Stable kind for errors callers can act on.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Enroll(e) => Some(e.kind()),
            Self::Identify(e) => Some(e.kind()),
            Self::Report(e) => Some(e.kind()),
            Self::Database(_) | Self::Store(_) => Some(ErrorKind::StoreUnavailable),
            _ => None,
        }
    }
}

/// Snapshot of engine state for the `Status` call.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub version: &'static str,
    pub model_version: &'static str,
    pub embedding_dim: usize,
    pub enrolled_employees: usize,
    pub embeddings: usize,
    pub active_employees: Option<usize>,
    pub similarity_threshold: f32,
    pub min_margin: f32,
    pub workers: usize,
}

/// Directory row plus how many embeddings are enrolled for it.
#[derive(Debug, Clone, Serialize)]
pub struct EmployeeEntry {
    #[serde(flatten)]
    pub employee: Employee,
    pub enrolled_embeddings: usize,
}

/// Messages sent from D-Bus handlers to the engine workers.
enum EngineRequest {
    RegisterEmployee {
        employee: Employee,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetActive {
        employee_id: EmployeeId,
        active: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    ListEmployees {
        active_only: bool,
        reply: oneshot::Sender<Result<Vec<EmployeeEntry>, EngineError>>,
    },
    Enroll {
        employee_id: EmployeeId,
        captures: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Verify {
        request: VerifyRequest,
        deadline: Instant,
        reply: oneshot::Sender<VerifyResponse>,
    },
    Identify {
        capture: Vec<u8>,
        reply: oneshot::Sender<Result<Identification, EngineError>>,
    },
    History {
        query: HistoryQuery,
        reply: oneshot::Sender<Result<Vec<HistoryEntry>, EngineError>>,
    },
    Summary {
        date: Option<NaiveDate>,
        reply: oneshot::Sender<Result<DailySummary, EngineError>>,
    },
    Today {
        reply: oneshot::Sender<NaiveDate>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    verify_timeout: Duration,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn register_employee(&self, employee: Employee) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::RegisterEmployee { employee, reply })
            .await?
    }

    /// Returns false if the employee does not exist. Deactivating removes
    /// the employee's embeddings; re-activation requires a new enrollment.
    pub async fn set_active(&self, employee_id: EmployeeId, active: bool) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::SetActive {
            employee_id,
            active,
            reply,
        })
        .await?
    }

    /// Employees ordered by id, with their enrolled embedding counts.
    pub async fn list_employees(&self, active_only: bool) -> Result<Vec<EmployeeEntry>, EngineError> {
        self.call(|reply| EngineRequest::ListEmployees { active_only, reply })
            .await?
    }

    pub async fn enroll(
        &self,
        employee_id: EmployeeId,
        captures: Vec<Vec<u8>>,
    ) -> Result<EnrollOutcome, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            employee_id,
            captures,
            reply,
        })
        .await?
    }

    /// The verify budget starts now, so time spent queued counts against it.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse, EngineError> {
        let deadline = Instant::now() + self.verify_timeout;
        self.call(|reply| EngineRequest::Verify {
            request,
            deadline,
            reply,
        })
        .await
    }

    pub async fn identify(&self, capture: Vec<u8>) -> Result<Identification, EngineError> {
        self.call(|reply| EngineRequest::Identify { capture, reply })
            .await?
    }

    pub async fn history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, EngineError> {
        self.call(|reply| EngineRequest::History { query, reply })
            .await?
    }

    pub async fn daily_summary(&self, date: Option<NaiveDate>) -> Result<DailySummary, EngineError> {
        self.call(|reply| EngineRequest::Summary { date, reply })
            .await?
    }

    /// Today's local calendar date.
    pub async fn today(&self) -> Result<NaiveDate, EngineError> {
        self.call(|reply| EngineRequest::Today { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Drop the employee's embeddings, then mark them inactive. A failed
/// removal leaves the directory row untouched.
fn deactivate(
    store: &EmbeddingStore,
    employee_id: &EmployeeId,
    mark_inactive: impl FnOnce() -> Result<bool, EngineError>,
) -> Result<bool, EngineError> {
    match store.remove(employee_id) {
        Ok(_) | Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    mark_inactive()
}

/// Logs issuance; delivery of credentials is handled outside the daemon.
struct AuditIssuer;

impl CredentialIssuer for AuditIssuer {
    fn issue(&self, employee_id: &EmployeeId) {
        tracing::info!(target: "clockface::audit", employee = %employee_id, "credential issued after enrollment");
    }
}

struct Engine {
    db: Arc<Database>,
    store: Arc<EmbeddingStore>,
    enrollment: EnrollmentService,
    gateway: VerificationGateway,
    status: EngineStatus,
}

impl Engine {
    fn build(db: Database, config: &Config) -> Result<Self, EngineError> {
        let db = Arc::new(match &config.embedding_key_hex {
            Some(hex) => db.with_cipher(EmbeddingCipher::from_hex(hex)?),
            None => db,
        });

        let extractor = Arc::new(HistogramExtractor::new());
        if extractor.dimension() != config.embedding_dim {
            return Err(EngineError::DimensionMismatch {
                expected: config.embedding_dim,
                actual: extractor.dimension(),
            });
        }

        let store = Arc::new(EmbeddingStore::open(
            config.embedding_dim,
            config.max_embeddings_per_employee,
            db.clone(),
        )?);
        let matcher = Arc::new(CosineMatcher::new(config.similarity_threshold, config.min_margin));

        let enrollment = EnrollmentService::new(
            store.clone(),
            matcher.clone(),
            extractor.clone(),
            EnrollmentConfig {
                min_samples: config.min_samples,
                quality_floor: config.quality_floor,
            },
        )
        .with_directory(db.clone())
        .with_credential_issuer(Arc::new(AuditIssuer));

        let ledger = Arc::new(AttendanceLedger::new(
            db.clone(),
            Arc::new(config.shift_policy()?),
            LedgerConfig {
                utc_offset: config.utc_offset()?,
                lock_timeout: config.lock_timeout(),
            },
        ));
        let gateway = VerificationGateway::new(extractor, store.clone(), matcher, ledger, db.clone());

        let status = EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            model_version: MODEL_VERSION,
            embedding_dim: config.embedding_dim,
            enrolled_employees: 0,
            embeddings: 0,
            active_employees: None,
            similarity_threshold: config.similarity_threshold,
            min_margin: config.min_margin,
            workers: config.engine_workers,
        };

        Ok(Self {
            db,
            store,
            enrollment,
            gateway,
            status,
        })
    }

    /// Deactivation also drops the employee's enrolled embeddings.
    fn set_active(&self, employee_id: &EmployeeId, active: bool) -> Result<bool, EngineError> {
        if active {
            return Ok(self.db.set_active(employee_id, true)?);
        }
        deactivate(&self.store, employee_id, || {
            Ok(self.db.set_active(employee_id, false)?)
        })
    }

    fn list_employees(&self, active_only: bool) -> Result<Vec<EmployeeEntry>, EngineError> {
        let snapshot = self.store.snapshot();
        Ok(self
            .db
            .list_employees(active_only)?
            .into_iter()
            .map(|employee| EmployeeEntry {
                enrolled_embeddings: snapshot
                    .embeddings(&employee.employee_id)
                    .map_or(0, |e| e.len()),
                employee,
            })
            .collect())
    }

    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::RegisterEmployee { employee, reply } => {
                let _ = reply.send(self.db.register_employee(&employee).map_err(Into::into));
            }
            EngineRequest::SetActive {
                employee_id,
                active,
                reply,
            } => {
                let _ = reply.send(self.set_active(&employee_id, active));
            }
            EngineRequest::ListEmployees { active_only, reply } => {
                let _ = reply.send(self.list_employees(active_only));
            }
            EngineRequest::Enroll {
                employee_id,
                captures,
                reply,
            } => {
                let result = self.enrollment.enroll(&employee_id, &captures);
                if let Err(e) = &result {
                    tracing::info!(employee = %employee_id, error = %e, "enroll refused");
                }
                let _ = reply.send(result.map_err(Into::into));
            }
            EngineRequest::Verify {
                request,
                deadline,
                reply,
            } => {
                let _ = reply.send(self.gateway.verify_until(request, Some(deadline)));
            }
            EngineRequest::Identify { capture, reply } => {
                let _ = reply.send(self.gateway.identify(&capture).map_err(Into::into));
            }
            EngineRequest::History { query, reply } => {
                let _ = reply.send(self.gateway.history(&query).map_err(Into::into));
            }
            EngineRequest::Summary { date, reply } => {
                let _ = reply.send(self.gateway.daily_summary(date).map_err(Into::into));
            }
            EngineRequest::Today { reply } => {
                let _ = reply.send(self.gateway.today());
            }
            EngineRequest::Status { reply } => {
                let snapshot = self.store.snapshot();
                let active = match self.db.active_count() {
                    Ok(n) => Some(n),
                    Err(e) => {
                        tracing::warn!(error = %e, "status: directory unavailable");
                        None
                    }
                };
                let _ = reply.send(EngineStatus {
                    enrolled_employees: snapshot.employee_count(),
                    embeddings: snapshot.len(),
                    active_employees: active,
                    ..self.status.clone()
                });
            }
        }
    }
}

/// Open the database named by `config` and start the engine.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let db = Database::open(&config.db_path)?;
    spawn_with_database(db, config)
}

/// Build the engine over `db` and start `config.engine_workers` OS threads
/// serving requests. Fails fast if the gallery cannot be loaded.
pub fn spawn_with_database(db: Database, config: &Config) -> Result<EngineHandle, EngineError> {
    let engine = Arc::new(Engine::build(db, config)?);
    tracing::info!(
        enrolled = engine.store.snapshot().employee_count(),
        dimension = config.embedding_dim,
        threshold = config.similarity_threshold,
        "engine ready"
    );

    let (tx, rx) = mpsc::channel::<EngineRequest>(64);
    let rx = Arc::new(Mutex::new(rx));

    for worker in 0..config.engine_workers.max(1) {
        let rx = Arc::clone(&rx);
        let engine = Arc::clone(&engine);
        std::thread::Builder::new()
            .name(format!("clockface-engine-{worker}"))
            .spawn(move || {
                tracing::debug!(worker, "engine worker started");
                loop {
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
                    match next {
                        Some(req) => engine.handle(req),
                        None => break,
                    }
                }
                tracing::debug!(worker, "engine worker exiting");
            })?;
    }

    Ok(EngineHandle {
        tx,
        verify_timeout: config.verify_timeout(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clockface_core::{Action, EmbeddingBackend, StoredEmbedding};
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn capture(shift: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(96, 96, |x, y| {
            let dx = x as i32 - (48 + shift) as i32;
            let dy = y as i32 - 48;
            Luma([if dx * dx + dy * dy < 900 { 190 } else { 50 + (y % 32) as u8 * 3 }])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn employee(code: &str) -> Employee {
        Employee {
            employee_id: EmployeeId::from(code),
            full_name: "Dewi Lestari".into(),
            email: format!("{code}@example.com"),
            phone: None,
            is_active: true,
        }
    }

    fn handle() -> EngineHandle {
        let config = Config {
            engine_workers: 2,
            ..Config::default()
        };
        spawn_with_database(Database::open_in_memory().unwrap(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_enroll_then_check_in_once() {
        let engine = handle();
        let id = EmployeeId::from("E100");
        engine.register_employee(employee("E100")).await.unwrap();

        let outcome = engine
            .enroll(id.clone(), vec![capture(0), capture(1), capture(2)])
            .await
            .unwrap();
        assert_eq!(outcome.accepted_samples, 3);

        let request = VerifyRequest {
            capture: capture(1),
            action: Action::CheckIn,
            location: None,
            device_info: None,
            client_timestamp: None,
        };
        let first = engine.verify(request.clone()).await.unwrap();
        assert!(first.success, "{first:?}");
        assert_eq!(first.employee_id, Some(id.clone()));

        let second = engine.verify(request).await.unwrap();
        assert_eq!(second.error_kind, Some(ErrorKind::AlreadyCheckedIn));

        let summary = engine.daily_summary(None).await.unwrap();
        assert_eq!(summary.total_employees, 1);
        assert_eq!(summary.checked_in, 1);

        let status = engine.status().await.unwrap();
        assert_eq!(status.enrolled_employees, 1);
        assert_eq!(status.embeddings, 3);
    }

    #[tokio::test]
    async fn test_enroll_unknown_employee_refused() {
        let engine = handle();
        let err = engine
            .enroll(EmployeeId::from("NOPE"), vec![capture(0); 3])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::EmployeeNotFound));
    }

    #[tokio::test]
    async fn test_deactivation_removes_face() {
        let engine = handle();
        let id = EmployeeId::from("E200");
        engine.register_employee(employee("E200")).await.unwrap();
        engine
            .enroll(id.clone(), vec![capture(0), capture(1), capture(2)])
            .await
            .unwrap();
        assert!(engine.set_active(id, false).await.unwrap());

        let resp = engine
            .verify(VerifyRequest {
                capture: capture(0),
                action: Action::CheckIn,
                location: None,
                device_info: None,
                client_timestamp: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.error_kind, Some(ErrorKind::IdentityNotRecognized));
        assert!(!resp.success);
        assert_eq!(engine.status().await.unwrap().embeddings, 0);
        assert!(!engine.set_active(EmployeeId::from("E404"), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_employees_with_enrollment_counts() {
        let engine = handle();
        for code in ["E302", "E301"] {
            engine.register_employee(employee(code)).await.unwrap();
        }
        engine
            .enroll(EmployeeId::from("E302"), vec![capture(0), capture(1), capture(2)])
            .await
            .unwrap();
        engine.set_active(EmployeeId::from("E301"), false).await.unwrap();

        let all = engine.list_employees(false).await.unwrap();
        let rows: Vec<_> = all
            .iter()
            .map(|e| (e.employee.employee_id.as_str(), e.employee.is_active, e.enrolled_embeddings))
            .collect();
        assert_eq!(rows, vec![("E301", false, 0), ("E302", true, 3)]);

        let active = engine.list_employees(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].employee.employee_id.as_str(), "E302");
    }

    /// Backend whose deletes always fail.
    struct StuckBackend(Vec<StoredEmbedding>);

    impl EmbeddingBackend for StuckBackend {
        fn load_all(&self) -> Result<Vec<StoredEmbedding>, StoreError> {
            Ok(self.0.clone())
        }

        fn replace(&self, _: &EmployeeId, _: &[StoredEmbedding]) -> Result<(), StoreError> {
            Ok(())
        }

        fn delete(&self, _: &EmployeeId) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk I/O error".into()))
        }
    }

    #[test]
    fn test_failed_face_removal_keeps_employee_active() {
        let id = EmployeeId::from("E500");
        let row = StoredEmbedding {
            employee_id: id.clone(),
            embedding: clockface_core::Embedding::new(vec![1.0, 0.0]),
            quality: 0.9,
            seq: 1,
            enrolled_at: chrono::Utc::now(),
        };
        let store = EmbeddingStore::open(2, 5, Arc::new(StuckBackend(vec![row]))).unwrap();

        let mut marked = false;
        let result = deactivate(&store, &id, || {
            marked = true;
            Ok(true)
        });
        assert!(matches!(result, Err(EngineError::Store(StoreError::Backend(_)))));
        assert!(!marked);
        assert_eq!(store.embeddings(&id).unwrap().len(), 1);

        let unknown = EmployeeId::from("E501");
        assert!(deactivate(&store, &unknown, || Ok(false)).is_ok_and(|found| !found));
    }
}
