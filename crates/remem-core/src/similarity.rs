use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::cell::CellId;
use crate::constants::NO_SIMILARITY;

/// Cosine similarity `dot(a, b) / (|a| |b|)`, accumulated in f64.
///
/// Zero-norm vectors, mismatched lengths and non-finite results all score
/// exactly `-1.0`, so they rank last and never divide by zero. The result is
/// clamped into `[-1, 1]` to absorb rounding.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return NO_SIMILARITY;
    }

    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    if na == 0.0 || nb == 0.0 {
        return NO_SIMILARITY;
    }

    let sim = dot / (na.sqrt() * nb.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        NO_SIMILARITY
    }
}

/// One cell's similarity to a query.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedCell {
    pub cell_id: CellId,
    pub score: f64,
}

/// Score every cell against `query`, best first.
///
/// Equal scores are ordered by ascending cell id so that rankings are
/// reproducible.
pub fn rank<'a, I>(query: &[f32], cells: I) -> Vec<RankedCell>
where
    I: IntoIterator<Item = (CellId, &'a [f32])>,
{
    let mut ranked: Vec<RankedCell> = cells
        .into_iter()
        .map(|(cell_id, vector)| RankedCell {
            cell_id,
            score: cosine(query, vector),
        })
        .collect();

    ranked.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.cell_id.cmp(&b.cell_id),
        other => other,
    });
    ranked
}
