//! Angular power spectrum containers.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Column layout of a spectrum file, selected from the column count of the
/// first data row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnLayout {
    /// (ℓ, value)
    TwoColumn,
    /// (ℓ, value, σ); extra trailing columns are ignored
    ThreeColumn,
}

impl ColumnLayout {
    /// Pick the layout for a row with `columns` fields.
    pub fn from_column_count(columns: usize) -> Option<Self> {
        match columns {
            0 | 1 => None,
            2 => Some(ColumnLayout::TwoColumn),
            _ => Some(ColumnLayout::ThreeColumn),
        }
    }

    pub fn has_sigma(&self) -> bool {
        matches!(self, ColumnLayout::ThreeColumn)
    }
}

/// One multipole bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumPoint {
    pub ell: u32,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f64>,
}

/// Dense symmetric covariance matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariance {
    dim: usize,
    data: Vec<f64>,
}

impl Covariance {
    /// Build a `dim × dim` matrix from row-major data.
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != dim * dim {
            return Err(anyhow!(
                "covariance has {} entries, expected {}x{} = {}",
                data.len(),
                dim,
                dim,
                dim * dim
            ));
        }
        Ok(Self { dim, data })
    }

    /// Diagonal matrix from per-bin sigmas.
    pub fn from_sigmas(sigmas: &[f64]) -> Self {
        let dim = sigmas.len();
        let mut data = vec![0.0; dim * dim];
        for (i, s) in sigmas.iter().enumerate() {
            data[i * dim + i] = s * s;
        }
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.dim + col]
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.dim).map(|i| self.get(i, i)).collect()
    }

    /// Extract the rows/columns at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.dim) {
            return Err(anyhow!(
                "covariance index {} out of range for dimension {}",
                bad,
                self.dim
            ));
        }
        let dim = indices.len();
        let mut data = Vec::with_capacity(dim * dim);
        for &r in indices {
            for &c in indices {
                data.push(self.get(r, c));
            }
        }
        Ok(Self { dim, data })
    }

    /// Multiply every entry by `factor(row) * factor(col)`.
    pub fn scaled_by(&self, factors: &[f64]) -> Result<Self> {
        if factors.len() != self.dim {
            return Err(anyhow!(
                "scale vector has {} entries for covariance of dimension {}",
                factors.len(),
                self.dim
            ));
        }
        let mut data = self.data.clone();
        for r in 0..self.dim {
            for c in 0..self.dim {
                data[r * self.dim + c] *= factors[r] * factors[c];
            }
        }
        Ok(Self {
            dim: self.dim,
            data,
        })
    }
}

/// An angular power spectrum as loaded from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub points: Vec<SpectrumPoint>,
    pub layout: ColumnLayout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covariance: Option<Covariance>,
}

impl Spectrum {
    pub fn new(points: Vec<SpectrumPoint>, layout: ColumnLayout) -> Self {
        Self {
            points,
            layout,
            covariance: None,
        }
    }

    /// Build a spectrum from parallel slices; `sigmas` selects the layout.
    pub fn from_columns(ells: &[u32], values: &[f64], sigmas: Option<&[f64]>) -> Self {
        let layout = if sigmas.is_some() {
            ColumnLayout::ThreeColumn
        } else {
            ColumnLayout::TwoColumn
        };
        let points = ells
            .iter()
            .zip(values)
            .enumerate()
            .map(|(i, (&ell, &value))| SpectrumPoint {
                ell,
                value,
                sigma: sigmas.map(|s| s[i]),
            })
            .collect();
        Self::new(points, layout)
    }

    pub fn with_covariance(mut self, covariance: Covariance) -> Self {
        self.covariance = Some(covariance);
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn ells(&self) -> Vec<u32> {
        self.points.iter().map(|p| p.ell).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Per-bin sigmas, if every bin carries one.
    pub fn sigmas(&self) -> Option<Vec<f64>> {
        self.points.iter().map(|p| p.sigma).collect()
    }

    /// Position of `ell` in this spectrum.
    pub fn index_of(&self, ell: u32) -> Option<usize> {
        self.points.binary_search_by_key(&ell, |p| p.ell).ok()
    }

    /// Apply a per-multipole factor to values, sigmas and covariance.
    pub fn map_by_ell(&self, factor: impl Fn(u32) -> f64) -> Result<Self> {
        let factors: Vec<f64> = self.points.iter().map(|p| factor(p.ell)).collect();
        let points = self
            .points
            .iter()
            .zip(&factors)
            .map(|(p, f)| SpectrumPoint {
                ell: p.ell,
                value: p.value * f,
                sigma: p.sigma.map(|s| s * f),
            })
            .collect();
        let covariance = match &self.covariance {
            Some(cov) => Some(cov.scaled_by(&factors)?),
            None => None,
        };
        Ok(Self {
            points,
            layout: self.layout,
            covariance,
        })
    }
}
