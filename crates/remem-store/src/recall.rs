//! Similarity search over stored cells plus reconstruction of the winner.

use std::fmt;

use serde::{Serialize, Serializer};

use remem_core::{CellId, DecodeError, ModelError, RankedCell, decode, rank};

use crate::error::{Result, StoreError};
use crate::store::CellStore;

/// Why the winning cell's text could not be rebuilt.
#[derive(Debug)]
pub enum ReconstructionError {
    Store(StoreError),
    Model(ModelError),
    Decode(DecodeError),
}

impl fmt::Display for ReconstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionError::Store(e) => write!(f, "{e}"),
            ReconstructionError::Model(e) => write!(f, "{e}"),
            ReconstructionError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReconstructionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconstructionError::Store(e) => Some(e),
            ReconstructionError::Model(e) => Some(e),
            ReconstructionError::Decode(e) => Some(e),
        }
    }
}

impl From<StoreError> for ReconstructionError {
    fn from(e: StoreError) -> Self {
        ReconstructionError::Store(e)
    }
}

impl From<ModelError> for ReconstructionError {
    fn from(e: ModelError) -> Self {
        ReconstructionError::Model(e)
    }
}

impl From<DecodeError> for ReconstructionError {
    fn from(e: DecodeError) -> Self {
        ReconstructionError::Decode(e)
    }
}

/// The best-scoring cell and what its model recalls.
#[derive(Debug, Serialize)]
pub struct TopCell {
    pub cell_id: CellId,
    pub score: f64,
    #[serde(serialize_with = "serialize_text")]
    pub text: std::result::Result<String, ReconstructionError>,
}

impl TopCell {
    /// Reconstructed text, or a visible error marker in its place.
    pub fn display_text(&self) -> String {
        match &self.text {
            Ok(text) => text.clone(),
            Err(e) => format!("[Reconstruction error]: {e}"),
        }
    }
}

fn serialize_text<S: Serializer>(
    text: &std::result::Result<String, ReconstructionError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match text {
        Ok(text) => serializer.serialize_str(text),
        Err(e) => serializer.collect_str(&format_args!("[Reconstruction error]: {e}")),
    }
}

#[derive(Debug, Serialize)]
pub struct RecallResult {
    /// Leading `top_k` entries of the ranking.
    pub distribution: Vec<RankedCell>,
    pub top_cell: TopCell,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RecallOutcome {
    /// The store holds no valid cell.
    NoMatch,
    Match(RecallResult),
}

impl RecallOutcome {
    pub fn into_match(self) -> Option<RecallResult> {
        match self {
            RecallOutcome::Match(result) => Some(result),
            RecallOutcome::NoMatch => None,
        }
    }
}

pub struct RecallEngine<'a> {
    store: &'a CellStore,
}

impl<'a> RecallEngine<'a> {
    pub fn new(store: &'a CellStore) -> Self {
        Self { store }
    }

    /// Rank every valid cell against `query` and reconstruct the best one.
    ///
    /// Works on one enumeration snapshot. Cells whose vector width differs
    /// from the query's are left out entirely. The winner's model is evaluated on
    /// the winner's own stored vector, not on the query. A `top_k` of 0 is
    /// treated as 1.
    pub fn recall(&self, query: &[f32], top_k: usize) -> Result<RecallOutcome> {
        let mut cells = self.store.enumerate()?;
        cells.retain(|cell| {
            let fits = cell.context_vector.len() == query.len();
            if !fits {
                tracing::warn!(
                    "skipping {}: {}-dim vector against a {}-dim query",
                    cell.cell_id,
                    cell.context_vector.len(),
                    query.len()
                );
            }
            fits
        });
        let mut ranked = rank(
            query,
            cells
                .iter()
                .map(|cell| (cell.cell_id, cell.context_vector.as_slice())),
        );
        let Some(best) = ranked.first().copied() else {
            return Ok(RecallOutcome::NoMatch);
        };
        ranked.truncate(top_k.max(1));

        let winner_vector = cells
            .iter()
            .find(|cell| cell.cell_id == best.cell_id)
            .map(|cell| cell.context_vector.as_slice())
            .unwrap_or_default();
        let text = self.reconstruct(best.cell_id, winner_vector);
        if let Err(e) = &text {
            tracing::warn!("reconstruction of {} failed: {e}", best.cell_id);
        }

        Ok(RecallOutcome::Match(RecallResult {
            distribution: ranked,
            top_cell: TopCell {
                cell_id: best.cell_id,
                score: best.score,
                text,
            },
        }))
    }

    fn reconstruct(
        &self,
        cell_id: CellId,
        context_vector: &[f32],
    ) -> std::result::Result<String, ReconstructionError> {
        let (model, _config) = self.store.load_model(cell_id)?;
        let tokens = model.reconstruct_tokens(context_vector)?;
        Ok(decode(&tokens)?)
    }
}
