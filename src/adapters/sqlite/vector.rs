//! Fixed-width vector column codec.
//!
//! Embeddings are 1024 `f32` values stored as a 4096-byte little-endian
//! blob. Packing and unpacking are symmetric; a mismatched width is an
//! input error, not a silent truncation.

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::ports::embedding::EMBEDDING_DIM;

pub const VECTOR_BLOB_LEN: usize = EMBEDDING_DIM * 4;

pub fn pack_vector(vector: &[f32]) -> CoreResult<Vec<u8>> {
    if vector.len() != EMBEDDING_DIM {
        return Err(CoreError::Invalid(format!(
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            vector.len()
        )));
    }
    let mut blob = Vec::with_capacity(VECTOR_BLOB_LEN);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    Ok(blob)
}

pub fn unpack_vector(blob: &[u8]) -> CoreResult<Vec<f32>> {
    if blob.len() != VECTOR_BLOB_LEN {
        return Err(CoreError::Invalid(format!(
            "vector blob has {} bytes, expected {VECTOR_BLOB_LEN}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine distance between two vectors. Zero-magnitude inputs are treated
/// as maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        mag_a += f64::from(*x) * f64::from(*x);
        mag_b += f64::from(*y) * f64::from(*y);
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (mag_a.sqrt() * mag_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 1.5;
        v[1023] = -2.25;
        let blob = pack_vector(&v).unwrap();
        assert_eq!(blob.len(), VECTOR_BLOB_LEN);
        assert_eq!(unpack_vector(&blob).unwrap(), v);
    }

    #[test]
    fn wrong_width_is_rejected() {
        assert!(pack_vector(&[1.0, 2.0]).is_err());
        assert!(unpack_vector(&[0u8; 8]).is_err());
    }

    #[test]
    fn cosine_distance_of_identical_vectors_is_zero() {
        let v = vec![0.5f32; 8];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_of_orthogonal_vectors_is_one() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }
}
