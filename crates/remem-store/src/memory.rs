//! High-level learn / recall over a [`CellStore`] and an embedder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use remem_core::{
    CancelFlag, CellId, EmbeddingError, FitConfig, FitError, Signal, SignalEmbedder, encode,
    fit_cell_observed,
};

use crate::error::StoreError;
use crate::recall::{RecallEngine, RecallOutcome};
use crate::store::{CONTEXT_VECTOR_FILE, CellStore, MODEL_CONFIG_FILE, MODEL_FILE};

#[derive(Debug)]
pub enum MemoryError {
    Embedding(EmbeddingError),
    Fit(FitError),
    Store(StoreError),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Embedding(e) => write!(f, "embedding failed: {e}"),
            MemoryError::Fit(e) => write!(f, "fit failed: {e}"),
            MemoryError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for MemoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemoryError::Embedding(e) => Some(e),
            MemoryError::Fit(e) => Some(e),
            MemoryError::Store(e) => Some(e),
        }
    }
}

impl From<EmbeddingError> for MemoryError {
    fn from(e: EmbeddingError) -> Self {
        MemoryError::Embedding(e)
    }
}

impl From<FitError> for MemoryError {
    fn from(e: FitError) -> Self {
        MemoryError::Fit(e)
    }
}

impl From<StoreError> for MemoryError {
    fn from(e: StoreError) -> Self {
        MemoryError::Store(e)
    }
}

/// Outcome of learning one cell.
#[derive(Debug, Clone, Serialize)]
pub struct LearnReport {
    pub cell_id: CellId,
    pub tokens_len: usize,
    pub epochs: usize,
    pub final_loss: f64,
    pub reached_target: bool,
    /// Artifact file name → written.
    pub saved: BTreeMap<String, bool>,
}

pub struct Memory {
    store: CellStore,
    embedder: Arc<dyn SignalEmbedder>,
    fit: FitConfig,
}

impl Memory {
    pub fn new(store: CellStore, embedder: Arc<dyn SignalEmbedder>, fit: FitConfig) -> Self {
        Self {
            store,
            embedder,
            fit,
        }
    }

    pub fn store(&self) -> &CellStore {
        &self.store
    }

    pub fn embedder(&self) -> &dyn SignalEmbedder {
        self.embedder.as_ref()
    }

    pub fn fit_config(&self) -> &FitConfig {
        &self.fit
    }

    /// Fit a new cell mapping `signal`'s embedding to `text`, and save it.
    pub fn learn(&self, signal: &Signal, text: &str) -> Result<LearnReport, MemoryError> {
        self.learn_with_cancel(signal, text, &CancelFlag::new())
    }

    /// [`Memory::learn`], stopping between epochs once `cancel` is set.
    /// A cancelled fit saves nothing.
    pub fn learn_with_cancel(
        &self,
        signal: &Signal,
        text: &str,
        cancel: &CancelFlag,
    ) -> Result<LearnReport, MemoryError> {
        let context = self.embedder.embed(signal)?;
        let tokens = encode(text);
        tracing::debug!(
            "learning {} tokens against a {}-dim {} embedding",
            tokens.len(),
            context.len(),
            self.embedder.name()
        );

        let fitted = fit_cell_observed(&context, &tokens, &self.fit, cancel, |p| {
            tracing::debug!("epoch {}/{}: loss {:.6e}", p.epoch, p.max_epochs, p.loss);
        })?;
        let report = fitted.report;
        if !report.reached_target {
            tracing::warn!(
                "target loss {:e} not reached after {} epochs (final {:.6e})",
                report.target_loss,
                report.actual_epochs,
                report.final_loss
            );
        }

        let cell_id = self.store.commit(&context, &fitted.model, &report)?;
        tracing::info!(
            "learned {cell_id}: {} tokens, {} epochs, loss {:.6e}",
            tokens.len(),
            report.actual_epochs,
            report.final_loss
        );

        let saved = [CONTEXT_VECTOR_FILE, MODEL_FILE, MODEL_CONFIG_FILE]
            .into_iter()
            .map(|file| (file.to_string(), true))
            .collect();
        Ok(LearnReport {
            cell_id,
            tokens_len: tokens.len(),
            epochs: report.actual_epochs,
            final_loss: report.final_loss,
            reached_target: report.reached_target,
            saved,
        })
    }

    pub fn recall(&self, query: &str, top_k: usize) -> Result<RecallOutcome, MemoryError> {
        self.recall_signal(&Signal::from(query), top_k)
    }

    pub fn recall_signal(
        &self,
        query: &Signal,
        top_k: usize,
    ) -> Result<RecallOutcome, MemoryError> {
        let vector = self.embedder.embed(query)?;
        Ok(RecallEngine::new(&self.store).recall(&vector, top_k)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remem_core::HashEmbedder;
    use tempfile::TempDir;

    struct FailingEmbedder;

    impl SignalEmbedder for FailingEmbedder {
        fn embed(&self, _signal: &Signal) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Provider {
                provider: "failing".into(),
                message: "offline".into(),
            })
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn memory(dir: &TempDir, embedder: Arc<dyn SignalEmbedder>) -> Memory {
        let store = CellStore::open(dir.path()).unwrap();
        let fit = FitConfig {
            max_epochs: 5,
            seed: Some(11),
            ..FitConfig::default()
        };
        Memory::new(store, embedder, fit)
    }

    #[test]
    fn test_learn_report() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(HashEmbedder::new(32)));
        let report = mem
            .learn(&Signal::from(&["summer", "paris"][..]), "Paris in summer")
            .unwrap();

        assert_eq!(report.cell_id.to_string(), "vec_0001");
        assert_eq!(report.tokens_len, encode("Paris in summer").len());
        assert!(report.epochs <= 5);
        assert_eq!(report.saved.len(), 3);
        assert!(report.saved.values().all(|&v| v));
        assert_eq!(mem.store().cell_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_learn_empty_text_is_fit_error() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(HashEmbedder::new(32)));
        let err = mem.learn(&Signal::from("anything"), "").unwrap_err();
        assert!(matches!(err, MemoryError::Fit(FitError::EmptyTokens)));
        assert!(mem.store().cell_ids().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_learn_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(HashEmbedder::new(32)));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = mem
            .learn_with_cancel(&Signal::from("k"), "text", &cancel)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Fit(FitError::Cancelled { .. })));
        assert!(mem.store().cell_ids().unwrap().is_empty());
    }

    #[test]
    fn test_embedding_failure_is_fatal_to_call() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(FailingEmbedder));
        assert!(matches!(
            mem.learn(&Signal::from("k"), "text").unwrap_err(),
            MemoryError::Embedding(_)
        ));
        assert!(matches!(
            mem.recall("k", 3).unwrap_err(),
            MemoryError::Embedding(_)
        ));
    }

    #[test]
    fn test_recall_empty_store() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(HashEmbedder::new(32)));
        assert!(matches!(
            mem.recall("anything", 3).unwrap(),
            RecallOutcome::NoMatch
        ));
    }

    #[test]
    fn test_learn_report_json_shape() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir, Arc::new(HashEmbedder::new(16)));
        let report = mem.learn(&Signal::from("k"), "hello").unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cell_id"], "vec_0001");
        assert_eq!(json["saved"]["model.pt"], true);
        assert!(json["final_loss"].is_number());
    }
}
