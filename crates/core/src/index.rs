use crate::error::IndexError;
use std::cmp::Ordering;

/// A hit from [`FlatIndex::search`]: the stored vector's position and its
/// squared Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Exact nearest-neighbor index over a contiguous row-major buffer.
///
/// Vectors are append-only and keep their insertion position, which is how
/// they are paired with entries in the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimensions: usize,
    values: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        Ok(Self {
            dimensions,
            values: Vec::new(),
        })
    }

    pub fn from_vectors(dimensions: usize, vectors: &[Vec<f32>]) -> Result<Self, IndexError> {
        let mut index = Self::new(dimensions)?;
        index.values.reserve(vectors.len() * dimensions);
        for vector in vectors {
            index.add(vector)?;
        }
        Ok(index)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.values.len() / self.dimensions
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Appends a vector and returns its position.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        self.check_dimensions(vector)?;
        let position = self.len();
        self.values.extend_from_slice(vector);
        Ok(position)
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.values.get(start..start + self.dimensions)
    }

    /// Returns the `k` stored vectors closest to `query`, nearest first.
    /// Equal distances are ordered by position, so results are stable across
    /// reloads. `k` larger than the index returns everything.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dimensions(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut neighbors = self
            .values
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, stored)| Neighbor {
                position,
                distance: squared_l2(stored, query),
            })
            .collect::<Vec<_>>();

        let k = k.min(neighbors.len());
        if k < neighbors.len() {
            neighbors.select_nth_unstable_by(k - 1, compare_neighbors);
            neighbors.truncate(k);
        }
        neighbors.sort_by(compare_neighbors);
        Ok(neighbors)
    }

    /// Little-endian `f32` payload, row after row.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for value in &self.values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Inverse of [`FlatIndex::to_le_bytes`]. The payload must hold exactly
    /// `count` rows of `dimensions` values.
    pub fn from_le_bytes(dimensions: usize, count: usize, bytes: &[u8]) -> Result<Self, IndexError> {
        let mut index = Self::new(dimensions)?;
        let expected = count
            .checked_mul(dimensions)
            .and_then(|values| values.checked_mul(4));
        if expected != Some(bytes.len()) {
            return Err(IndexError::Corrupt {
                name: "vector payload".to_string(),
                reason: format!(
                    "{} bytes cannot hold {count} vectors of {dimensions} dimensions",
                    bytes.len()
                ),
            });
        }

        index.values = bytes
            .chunks_exact(4)
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();
        Ok(index)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = a - b;
            delta * delta
        })
        .sum()
}

fn compare_neighbors(left: &Neighbor, right: &Neighbor) -> Ordering {
    left.distance
        .total_cmp(&right.distance)
        .then(left.position.cmp(&right.position))
}
