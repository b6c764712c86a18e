//! Embedding store: enrolled face embeddings, keyed by employee.
//!
//! Readers take an immutable [`GallerySnapshot`] (an `Arc` clone) and never
//! observe a write in progress. Writers are serialized, commit to the
//! optional [`EmbeddingBackend`] first, and only then publish a new snapshot.

use crate::types::{Embedding, EmployeeId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no embeddings enrolled for employee {0}")]
    NotFound(EmployeeId),
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding backend: {0}")]
    Backend(String),
}

/// An enrolled embedding with its capture metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub employee_id: EmployeeId,
    pub embedding: Embedding,
    /// Capture quality at enrollment, in [0, 1].
    pub quality: f32,
    /// Monotonic insertion sequence; lower = older.
    pub seq: u64,
    pub enrolled_at: DateTime<Utc>,
}

/// Durable home for enrolled embeddings.
///
/// `replace` must be atomic: after it returns `Ok`, the employee's rows are
/// exactly `embeddings`; after `Err`, they are unchanged.
pub trait EmbeddingBackend: Send + Sync {
    fn load_all(&self) -> Result<Vec<StoredEmbedding>, StoreError>;
    fn replace(
        &self,
        employee_id: &EmployeeId,
        embeddings: &[StoredEmbedding],
    ) -> Result<(), StoreError>;
    fn delete(&self, employee_id: &EmployeeId) -> Result<(), StoreError>;
}

/// Point-in-time copy of every enrolled embedding, ordered by employee id.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    dimension: usize,
    entries: BTreeMap<EmployeeId, Arc<Vec<StoredEmbedding>>>,
}

impl GallerySnapshot {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn employee_count(&self) -> usize {
        self.entries.len()
    }

    /// Total number of embeddings across all employees.
    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn embeddings(&self, employee_id: &EmployeeId) -> Option<&[StoredEmbedding]> {
        self.entries.get(employee_id).map(|v| v.as_slice())
    }

    /// Iterate employees in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (&EmployeeId, &[StoredEmbedding])> {
        self.entries.iter().map(|(id, v)| (id, v.as_slice()))
    }
}

/// In-memory embedding store with optional write-through persistence.
pub struct EmbeddingStore {
    dimension: usize,
    max_per_employee: usize,
    current: RwLock<Arc<GallerySnapshot>>,
    /// Serializes writers so each read-modify-publish sees the latest snapshot.
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    backend: Option<Arc<dyn EmbeddingBackend>>,
}

impl EmbeddingStore {
    /// Create an empty, memory-only store.
    pub fn new(dimension: usize, max_per_employee: usize) -> Self {
        Self {
            dimension,
            max_per_employee: max_per_employee.max(1),
            current: RwLock::new(Arc::new(GallerySnapshot {
                dimension,
                entries: BTreeMap::new(),
            })),
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            backend: None,
        }
    }

    /// Open a store backed by `backend`, loading everything it holds.
    ///
    /// Rows whose length differs from `dimension` fail the open: the
    /// extractor configuration changed and the gallery must be re-enrolled.
    pub fn open(
        dimension: usize,
        max_per_employee: usize,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Result<Self, StoreError> {
        let rows = backend.load_all()?;
        let mut entries: BTreeMap<EmployeeId, Vec<StoredEmbedding>> = BTreeMap::new();
        let mut max_seq = 0u64;

        for row in rows {
            if row.embedding.dim() != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    actual: row.embedding.dim(),
                });
            }
            max_seq = max_seq.max(row.seq);
            entries.entry(row.employee_id.clone()).or_default().push(row);
        }
        for list in entries.values_mut() {
            list.sort_by_key(|e| e.seq);
        }

        tracing::info!(
            employees = entries.len(),
            embeddings = entries.values().map(Vec::len).sum::<usize>(),
            dimension,
            "embedding store loaded"
        );

        let store = Self::new(dimension, max_per_employee);
        store.next_seq.store(max_seq + 1, Ordering::SeqCst);
        *store.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(GallerySnapshot {
            dimension,
            entries: entries.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        });
        Ok(Self { backend: Some(backend), ..store })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Consistent, immutable view of the store as of now.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Append one embedding, evicting the lowest-quality one past the cap.
    pub fn put(
        &self,
        employee_id: &EmployeeId,
        embedding: Embedding,
        quality: f32,
    ) -> Result<(), StoreError> {
        self.put_all(employee_id, vec![(embedding, quality)]).map(|_| ())
    }

    /// Append a batch as one atomic commit and return how many of the new
    /// embeddings survived eviction.
    ///
    /// Either every embedding is validated, persisted and published, or none
    /// is. Eviction rules are the same as [`put`](Self::put). When every new
    /// embedding would be evicted at once, nothing is written and 0 is returned.
    pub fn put_all(
        &self,
        employee_id: &EmployeeId,
        samples: Vec<(Embedding, f32)>,
    ) -> Result<usize, StoreError> {
        if let Some((bad, _)) = samples.iter().find(|(e, _)| e.dim() != self.dimension) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.dim(),
            });
        }
        if samples.is_empty() {
            return Ok(0);
        }

        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();

        let mut list: Vec<StoredEmbedding> = base
            .embeddings(employee_id)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let enrolled_at = Utc::now();
        let first_new_seq = self.next_seq.load(Ordering::SeqCst);
        for (embedding, quality) in samples {
            list.push(StoredEmbedding {
                employee_id: employee_id.clone(),
                embedding,
                quality,
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                enrolled_at,
            });
        }
        let evicted = evict_to_cap(&mut list, self.max_per_employee);
        if evicted > 0 {
            tracing::debug!(employee = %employee_id, evicted, "evicted low-quality embeddings");
        }
        let retained = list.iter().filter(|e| e.seq >= first_new_seq).count();
        if retained == 0 {
            return Ok(0);
        }

        if let Some(backend) = &self.backend {
            backend.replace(employee_id, &list)?;
        }

        let mut next = (*base).clone();
        next.entries.insert(employee_id.clone(), Arc::new(list));
        self.publish(next);
        Ok(retained)
    }

    /// An employee's current embeddings, oldest first.
    pub fn embeddings(&self, employee_id: &EmployeeId) -> Result<Vec<StoredEmbedding>, StoreError> {
        self.snapshot()
            .embeddings(employee_id)
            .map(|s| s.to_vec())
            .ok_or_else(|| StoreError::NotFound(employee_id.clone()))
    }

    /// Delete every embedding for an employee.
    pub fn remove(&self, employee_id: &EmployeeId) -> Result<usize, StoreError> {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();
        let removed = base
            .embeddings(employee_id)
            .map(|s| s.len())
            .ok_or_else(|| StoreError::NotFound(employee_id.clone()))?;

        if let Some(backend) = &self.backend {
            backend.delete(employee_id)?;
        }

        let mut next = (*base).clone();
        next.entries.remove(employee_id);
        self.publish(next);
        tracing::info!(employee = %employee_id, removed, "embeddings removed");
        Ok(removed)
    }

    fn publish(&self, next: GallerySnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

/// Drop entries until `list.len() <= cap`: lowest quality first, oldest
/// first among equal quality. Returns how many were dropped.
fn evict_to_cap(list: &mut Vec<StoredEmbedding>, cap: usize) -> usize {
    let mut evicted = 0;
    while list.len() > cap {
        let victim = list
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.quality.total_cmp(&b.quality).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                list.remove(i);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}
