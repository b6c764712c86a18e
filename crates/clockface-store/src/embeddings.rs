//! Face embedding rows. Vectors are little-endian f32 blobs, sealed with
//! AES-256-GCM when the database has a cipher.

use crate::{format_ts, parse_ts, Database, DbError, Result};
use clockface_core::{Embedding, EmbeddingBackend, EmployeeId, StoreError, StoredEmbedding};
use rusqlite::params;

struct RawEmbedding {
    seq: i64,
    employee_id: String,
    quality: f64,
    dimension: i64,
    vector: Vec<u8>,
    nonce: Option<Vec<u8>>,
    model_version: Option<String>,
    enrolled_at: chrono::DateTime<chrono::Utc>,
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8], dimension: usize) -> Result<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return Err(DbError::InvalidDbValue(format!(
            "embedding blob is {} bytes, expected {} for dimension {dimension}",
            bytes.len(),
            dimension * 4
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl Database {
    fn decode_embedding(&self, raw: RawEmbedding) -> Result<StoredEmbedding> {
        let seq = u64::try_from(raw.seq)
            .map_err(|_| DbError::InvalidDbValue(format!("negative embedding seq {}", raw.seq)))?;
        let dimension = usize::try_from(raw.dimension).map_err(|_| {
            DbError::InvalidDbValue(format!("embedding dimension {}", raw.dimension))
        })?;
        let plaintext = match (&raw.nonce, &self.cipher) {
            (None, _) => raw.vector,
            (Some(nonce), Some(cipher)) => cipher.open(nonce, &raw.vector)?,
            (Some(_), None) => {
                return Err(DbError::Crypto(
                    "embeddings are encrypted but no key is configured".into(),
                ))
            }
        };
        Ok(StoredEmbedding {
            employee_id: EmployeeId::new(raw.employee_id),
            embedding: Embedding {
                values: decode_vector(&plaintext, dimension)?,
                model_version: raw.model_version,
            },
            quality: raw.quality as f32,
            seq,
            enrolled_at: raw.enrolled_at,
        })
    }

    fn load_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT seq, employee_id, quality, dimension, vector, nonce, model_version, enrolled_at
                 FROM face_embeddings ORDER BY seq",
            )?;
            let rows = stmt.query_map([], |row| {
                let enrolled_at: String = row.get(7)?;
                Ok(RawEmbedding {
                    seq: row.get(0)?,
                    employee_id: row.get(1)?,
                    quality: row.get(2)?,
                    dimension: row.get(3)?,
                    vector: row.get(4)?,
                    nonce: row.get(5)?,
                    model_version: row.get(6)?,
                    enrolled_at: parse_ts(7, &enrolled_at)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(|raw| self.decode_embedding(raw)).collect()
    }

    fn replace_embeddings(&self, employee_id: &EmployeeId, embeddings: &[StoredEmbedding]) -> Result<()> {
        let mut sealed = Vec::with_capacity(embeddings.len());
        for e in embeddings {
            let seq = i64::try_from(e.seq)
                .map_err(|_| DbError::InvalidDbValue(format!("embedding seq {} overflows", e.seq)))?;
            let plain = encode_vector(&e.embedding.values);
            let (vector, nonce) = match &self.cipher {
                Some(cipher) => {
                    let (ciphertext, nonce) = cipher.seal(&plain)?;
                    (ciphertext, Some(nonce.to_vec()))
                }
                None => (plain, None),
            };
            sealed.push((seq, e, vector, nonce));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM face_embeddings WHERE employee_id = ?1",
            params![employee_id.as_str()],
        )?;
        for (seq, e, vector, nonce) in &sealed {
            tx.execute(
                "INSERT INTO face_embeddings
                    (seq, employee_id, quality, dimension, vector, nonce, model_version, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    seq,
                    employee_id.as_str(),
                    f64::from(e.quality),
                    e.embedding.dim() as i64,
                    vector,
                    nonce,
                    e.embedding.model_version,
                    format_ts(e.enrolled_at),
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(employee = %employee_id, rows = sealed.len(), "embeddings persisted");
        Ok(())
    }
}

impl EmbeddingBackend for Database {
    fn load_all(&self) -> std::result::Result<Vec<StoredEmbedding>, StoreError> {
        Ok(self.load_embeddings()?)
    }

    fn replace(
        &self,
        employee_id: &EmployeeId,
        embeddings: &[StoredEmbedding],
    ) -> std::result::Result<(), StoreError> {
        Ok(self.replace_embeddings(employee_id, embeddings)?)
    }

    fn delete(&self, employee_id: &EmployeeId) -> std::result::Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM face_embeddings WHERE employee_id = ?1",
                params![employee_id.as_str()],
            )
            .map_err(DbError::from)?;
        Ok(())
    }
}
