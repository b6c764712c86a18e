//! Enrollment: turn a batch of captures into committed embeddings.

use crate::directory::{CredentialIssuer, Directory, DirectoryError};
use crate::error::ErrorKind;
use crate::extract::FeatureExtractor;
use crate::gallery::{EmbeddingStore, StoreError};
use crate::matcher::{MatchError, Matcher};
use crate::types::{Embedding, EmployeeId};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const DEFAULT_MIN_SAMPLES: usize = 3;
const DEFAULT_QUALITY_FLOOR: f32 = 0.5;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("only {accepted} samples passed quality filtering, {required} required")]
    InsufficientSamples { accepted: usize, required: usize },
    #[error("sample matches already enrolled employee {conflicting}")]
    AmbiguousIdentity { conflicting: EmployeeId },
    #[error("sample has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("employee {0} not found in directory")]
    EmployeeNotFound(EmployeeId),
    #[error("employee {0} is not active")]
    EmployeeInactive(EmployeeId),
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            other => Self::Store(other),
        }
    }
}

impl From<MatchError> for EnrollError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
        }
    }
}

impl EnrollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientSamples { .. } => ErrorKind::InsufficientSamples,
            Self::AmbiguousIdentity { .. } => ErrorKind::AmbiguousIdentity,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::EmployeeNotFound(_) => ErrorKind::EmployeeNotFound,
            Self::EmployeeInactive(_) => ErrorKind::EmployeeInactive,
            Self::Directory(_) => ErrorKind::StoreUnavailable,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::EmployeeNotFound,
            Self::Store(_) => ErrorKind::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentConfig {
    /// Minimum number of samples that must pass the quality floor.
    pub min_samples: usize,
    /// Samples below this quality are discarded.
    pub quality_floor: f32,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            quality_floor: DEFAULT_QUALITY_FLOOR,
        }
    }
}

/// One extracted enrollment sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub embedding: Embedding,
    pub quality: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollOutcome {
    pub employee_id: EmployeeId,
    pub accepted_samples: usize,
    pub rejected_samples: usize,
}

pub struct EnrollmentService {
    store: Arc<EmbeddingStore>,
    matcher: Arc<dyn Matcher>,
    extractor: Arc<dyn FeatureExtractor>,
    directory: Option<Arc<dyn Directory>>,
    issuer: Option<Arc<dyn CredentialIssuer>>,
    config: EnrollmentConfig,
    /// Collision check and commit must see each other's results.
    enroll_lock: Mutex<()>,
}

impl EnrollmentService {
    pub fn new(
        store: Arc<EmbeddingStore>,
        matcher: Arc<dyn Matcher>,
        extractor: Arc<dyn FeatureExtractor>,
        config: EnrollmentConfig,
    ) -> Self {
        Self {
            store,
            matcher,
            extractor,
            directory: None,
            issuer: None,
            config,
            enroll_lock: Mutex::new(()),
        }
    }

    /// Refuse unknown or inactive employees.
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_credential_issuer(mut self, issuer: Arc<dyn CredentialIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Extract every capture and enroll the results.
    ///
    /// Captures the extractor cannot use count as rejected samples.
    pub fn enroll(
        &self,
        employee_id: &EmployeeId,
        captures: &[Vec<u8>],
    ) -> Result<EnrollOutcome, EnrollError> {
        let mut samples = Vec::with_capacity(captures.len());
        let mut unusable = 0usize;
        for (i, capture) in captures.iter().enumerate() {
            match self.extractor.extract(capture) {
                Ok(x) => samples.push(Sample {
                    embedding: x.embedding,
                    quality: x.quality,
                }),
                Err(e) => {
                    tracing::debug!(employee = %employee_id, capture = i, error = %e, "enroll: capture unusable");
                    unusable += 1;
                }
            }
        }

        let mut outcome = self.enroll_samples(employee_id, samples)?;
        outcome.rejected_samples += unusable;
        Ok(outcome)
    }

    /// Validate already-extracted samples and commit them atomically.
    pub fn enroll_samples(
        &self,
        employee_id: &EmployeeId,
        samples: Vec<Sample>,
    ) -> Result<EnrollOutcome, EnrollError> {
        if let Some(directory) = &self.directory {
            match directory.employee(employee_id)? {
                None => return Err(EnrollError::EmployeeNotFound(employee_id.clone())),
                Some(e) if !e.is_active => {
                    return Err(EnrollError::EmployeeInactive(employee_id.clone()))
                }
                Some(_) => {}
            }
        }

        let dimension = self.store.dimension();
        if let Some(bad) = samples.iter().find(|s| s.embedding.dim() != dimension) {
            return Err(EnrollError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.dim(),
            });
        }

        let total = samples.len();
        let kept: Vec<Sample> = samples
            .into_iter()
            .filter(|s| s.quality >= self.config.quality_floor)
            .collect();
        let rejected = total - kept.len();

        if kept.len() < self.config.min_samples {
            tracing::info!(
                employee = %employee_id,
                accepted = kept.len(),
                rejected,
                required = self.config.min_samples,
                "enroll: insufficient samples"
            );
            return Err(EnrollError::InsufficientSamples {
                accepted: kept.len(),
                required: self.config.min_samples,
            });
        }

        let _guard = self.enroll_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let snapshot = self.store.snapshot();
        for sample in &kept {
            let result = self.matcher.find(&sample.embedding, &snapshot, Some(employee_id))?;
            if let Some(conflicting) = result.employee_id.filter(|_| result.accepted) {
                tracing::warn!(
                    target: "clockface::audit",
                    employee = %employee_id,
                    conflicting = %conflicting,
                    score = result.score,
                    "enroll: sample collides with enrolled employee"
                );
                return Err(EnrollError::AmbiguousIdentity { conflicting });
            }
        }

        let kept_count = kept.len();
        let accepted = self.store.put_all(
            employee_id,
            kept.into_iter().map(|s| (s.embedding, s.quality)).collect(),
        )?;
        if accepted == 0 {
            tracing::info!(
                employee = %employee_id,
                kept = kept_count,
                "enroll: no sample outranks the enrolled embeddings"
            );
            return Err(EnrollError::InsufficientSamples {
                accepted: 0,
                required: self.config.min_samples,
            });
        }
        let rejected = total - accepted;

        tracing::info!(employee = %employee_id, accepted, rejected, "enroll: committed");

        if let Some(issuer) = &self.issuer {
            issuer.issue(employee_id);
        }

        Ok(EnrollOutcome {
            employee_id: employee_id.clone(),
            accepted_samples: accepted,
            rejected_samples: rejected,
        })
    }
}
