//! Per-period result stores.
//!
//! Stores are indexed by time. Slots before `start` are never written, and a
//! slot that was never saved reads back as `None`, which is different from
//! a saved zero.

use nalgebra::{DMatrix, DVector};

const INITIAL_CAPACITY: usize = 16;

/// Contiguous storage of fixed-size blocks of `f64`, one block per period.
#[derive(Debug, Clone, PartialEq)]
struct BlockStore {
    data: Vec<f64>,
    present: Vec<bool>,
    block: usize,
    start: usize,
    size: usize,
    capacity: usize,
}

impl BlockStore {
    fn new(block: usize, start: usize, expected: usize) -> Self {
        let capacity = expected.saturating_sub(start).max(INITIAL_CAPACITY);
        Self {
            data: vec![f64::NAN; capacity * block],
            present: vec![false; capacity],
            block,
            start,
            size: 0,
            capacity,
        }
    }

    fn reserve(&mut self, slots: usize) {
        if slots <= self.capacity {
            return;
        }
        let mut capacity = self.capacity.max(1);
        while capacity < slots {
            capacity *= 2;
        }
        self.data.resize(capacity * self.block, f64::NAN);
        self.present.resize(capacity, false);
        self.capacity = capacity;
    }

    fn save(&mut self, t: usize, values: &[f64]) {
        if t < self.start {
            return;
        }
        debug_assert_eq!(values.len(), self.block);
        let idx = t - self.start;
        self.reserve(idx + 1);
        let off = idx * self.block;
        self.data[off..off + self.block].copy_from_slice(values);
        self.present[idx] = true;
        self.size = self.size.max(idx + 1);
    }

    fn get(&self, t: usize) -> Option<&[f64]> {
        if t < self.start {
            return None;
        }
        let idx = t - self.start;
        if idx >= self.size || !self.present[idx] {
            return None;
        }
        let off = idx * self.block;
        Some(&self.data[off..off + self.block])
    }

    /// One past the last saved period.
    fn end(&self) -> usize {
        self.start + self.size
    }

    fn rescale(&mut self, factor: f64) {
        for (slot, present) in self.present.iter().enumerate().take(self.size) {
            if *present {
                let off = slot * self.block;
                for v in &mut self.data[off..off + self.block] {
                    *v *= factor;
                }
            }
        }
    }

    /// Entry `i` of every block from 0 to `end()`, NaN where absent or when
    /// `i` lies outside the block.
    fn path(&self, i: usize) -> Vec<f64> {
        (0..self.end())
            .map(|t| self.get(t).and_then(|b| b.get(i).copied()).unwrap_or(f64::NAN))
            .collect()
    }
}

/// One vector of dimension `dim` per period.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStore {
    inner: BlockStore,
    dim: usize,
}

impl VectorStore {
    pub fn new(dim: usize, start: usize, expected: usize) -> Self {
        Self {
            inner: BlockStore::new(dim, start, expected),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn start(&self) -> usize {
        self.inner.start
    }

    pub fn end(&self) -> usize {
        self.inner.end()
    }

    pub fn save(&mut self, t: usize, x: &DVector<f64>) {
        self.inner.save(t, x.as_slice());
    }

    pub fn get(&self, t: usize) -> Option<DVector<f64>> {
        self.inner.get(t).map(DVector::from_column_slice)
    }

    pub fn contains(&self, t: usize) -> bool {
        self.inner.get(t).is_some()
    }

    /// Coordinate `i` over time; all NaN when `i >= dim`.
    pub fn component(&self, i: usize) -> Vec<f64> {
        self.inner.path(i)
    }

    pub fn rescale(&mut self, factor: f64) {
        self.inner.rescale(factor);
    }
}

/// One square matrix of dimension `dim` per period.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixStore {
    inner: BlockStore,
    dim: usize,
}

impl MatrixStore {
    pub fn new(dim: usize, start: usize, expected: usize) -> Self {
        Self {
            inner: BlockStore::new(dim * dim, start, expected),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn start(&self) -> usize {
        self.inner.start
    }

    pub fn end(&self) -> usize {
        self.inner.end()
    }

    pub fn save(&mut self, t: usize, m: &DMatrix<f64>) {
        self.inner.save(t, m.as_slice());
    }

    pub fn get(&self, t: usize) -> Option<DMatrix<f64>> {
        self.inner
            .get(t)
            .map(|s| DMatrix::from_column_slice(self.dim, self.dim, s))
    }

    pub fn contains(&self, t: usize) -> bool {
        self.inner.get(t).is_some()
    }

    /// Diagonal entry (i, i) over time; all NaN when `i >= dim`.
    pub fn component(&self, i: usize) -> Vec<f64> {
        self.inner.path(i * self.dim + i)
    }

    pub fn rescale(&mut self, factor: f64) {
        self.inner.rescale(factor);
    }
}

/// One scalar per period.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarStore {
    inner: BlockStore,
}

impl ScalarStore {
    pub fn new(start: usize, expected: usize) -> Self {
        Self {
            inner: BlockStore::new(1, start, expected),
        }
    }

    pub fn end(&self) -> usize {
        self.inner.end()
    }

    pub fn save(&mut self, t: usize, x: f64) {
        self.inner.save(t, &[x]);
    }

    pub fn get(&self, t: usize) -> Option<f64> {
        self.inner.get(t).map(|s| s[0])
    }

    pub fn values(&self) -> Vec<f64> {
        self.inner.path(0)
    }

    pub fn rescale(&mut self, factor: f64) {
        self.inner.rescale(factor);
    }
}
