use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use remem_core::{Architecture, CellId, CellModel, FitReport};

use crate::error::{Result, StoreError};

pub const CONTEXT_VECTOR_FILE: &str = "context_vector.json";
pub const MODEL_FILE: &str = "model.pt";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

const STAGING_PREFIX: &str = ".staging-";

/// Id collisions with other writers tolerated before a commit gives up.
const COMMIT_ATTEMPTS: usize = 16;

/// Contents of `model_config.json`: architecture plus fit metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
    /// Epoch cap the fit ran under.
    pub epochs: usize,
    pub target_loss: f64,
    pub actual_epochs: usize,
    pub final_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reached_target: Option<bool>,
}

impl ModelConfig {
    pub fn new(arch: Architecture, report: &FitReport) -> Self {
        Self {
            input_dim: arch.input_dim,
            hidden_dim: arch.hidden_dim,
            output_dim: arch.output_dim,
            epochs: report.max_epochs,
            target_loss: report.target_loss,
            actual_epochs: report.actual_epochs,
            final_loss: report.final_loss,
            learning_rate: Some(report.learning_rate),
            reached_target: Some(report.reached_target),
        }
    }

    pub fn architecture(&self) -> Architecture {
        Architecture {
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim,
            output_dim: self.output_dim,
        }
    }

    /// Older configs lack the flag; fall back to comparing the losses.
    pub fn reached_target(&self) -> bool {
        self.reached_target
            .unwrap_or(self.final_loss <= self.target_loss)
    }
}

/// A cell's id and context vector, as seen by an enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub cell_id: CellId,
    pub context_vector: Vec<f32>,
}

/// Append-only directory of memory cells.
///
/// Layout:
/// ```text
/// <root>/
/// ├── vec_0001/
/// │   ├── context_vector.json
/// │   ├── model.pt
/// │   └── model_config.json
/// └── vec_0002/ …
/// ```
///
/// Cells are written into a `.staging-<uuid>` directory and renamed into
/// place, so a `vec_*` directory is always complete. Id allocation plus
/// rename happen under one writer lock per store handle; the rename refusing
/// to replace an existing cell guards against other processes.
pub struct CellStore {
    root: PathBuf,
    writer: Mutex<()>,
}

impl CellStore {
    /// Open the store at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cell_dir(&self, cell_id: CellId) -> PathBuf {
        self.root.join(cell_id.to_string())
    }

    // --- Identity ---

    /// Ids of every `vec_*` directory, ascending. A missing root is empty.
    pub fn cell_ids(&self) -> Result<Vec<CellId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };

        let mut ids: Vec<CellId> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Next unused id: one past the highest existing id. Gaps are not reused.
    ///
    /// Not synchronized on its own; [`CellStore::commit`] pairs it with the
    /// rename under the writer lock.
    pub fn allocate_id(&self) -> Result<CellId> {
        Ok(self
            .cell_ids()?
            .last()
            .map(|id| id.next())
            .unwrap_or(CellId::FIRST))
    }

    // --- Save ---

    /// Write a cell under an explicit id.
    pub fn save(
        &self,
        cell_id: CellId,
        context_vector: &[f32],
        model: &CellModel,
        report: &FitReport,
    ) -> Result<()> {
        if self.cell_dir(cell_id).exists() {
            return Err(StoreError::CellExists(cell_id));
        }
        let staging = self.stage(context_vector, model, report)?;
        let result = self.publish(&staging, cell_id);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    /// Allocate an id and write the cell under it, atomically with respect
    /// to other commits through this handle.
    pub fn commit(
        &self,
        context_vector: &[f32],
        model: &CellModel,
        report: &FitReport,
    ) -> Result<CellId> {
        let staging = self.stage(context_vector, model, report)?;
        let result = self.publish_next(&staging);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn publish_next(&self, staging: &Path) -> Result<CellId> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..COMMIT_ATTEMPTS {
            let cell_id = self.allocate_id()?;
            match self.publish(staging, cell_id) {
                Ok(()) => return Ok(cell_id),
                Err(StoreError::CellExists(taken)) => {
                    tracing::debug!("cell id {taken} taken by another writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::InvalidData(format!(
            "could not allocate a cell id after {COMMIT_ATTEMPTS} attempts"
        )))
    }

    fn stage(
        &self,
        context_vector: &[f32],
        model: &CellModel,
        report: &FitReport,
    ) -> Result<PathBuf> {
        let arch = model
            .validate()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        if arch.input_dim != context_vector.len() {
            return Err(StoreError::InvalidData(format!(
                "model takes {} inputs but context vector has {}",
                arch.input_dim,
                context_vector.len()
            )));
        }

        let staging = self.root.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir(&staging).map_err(|e| StoreError::io(&staging, e))?;

        let written = write_json(&staging.join(CONTEXT_VECTOR_FILE), &context_vector)
            .and_then(|()| write_blob(&staging.join(MODEL_FILE), model))
            .and_then(|()| {
                write_json(
                    &staging.join(MODEL_CONFIG_FILE),
                    &ModelConfig::new(arch, report),
                )
            });
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        Ok(staging)
    }

    fn publish(&self, staging: &Path, cell_id: CellId) -> Result<()> {
        let target = self.cell_dir(cell_id);
        if target.exists() {
            return Err(StoreError::CellExists(cell_id));
        }
        fs::rename(staging, &target).map_err(|e| {
            if target.exists() {
                StoreError::CellExists(cell_id)
            } else {
                StoreError::io(&target, e)
            }
        })
    }

    // --- Load ---

    /// Snapshot of every cell with a readable context vector, ordered by id.
    ///
    /// Cells whose vector is missing or corrupt are logged and left out.
    pub fn enumerate(&self) -> Result<Vec<StoredVector>> {
        let mut cells = Vec::new();
        for cell_id in self.cell_ids()? {
            match self.load_context_vector(cell_id) {
                Ok(context_vector) => cells.push(StoredVector {
                    cell_id,
                    context_vector,
                }),
                Err(e) => tracing::warn!("skipping cell {cell_id}: {e}"),
            }
        }
        Ok(cells)
    }

    pub fn load_context_vector(&self, cell_id: CellId) -> Result<Vec<f32>> {
        let path = self.cell_dir(cell_id).join(CONTEXT_VECTOR_FILE);
        let vector: Vec<f32> = read_json(&path)?;
        if vector.is_empty() {
            return Err(StoreError::InvalidData(format!(
                "{} holds an empty vector",
                path.display()
            )));
        }
        Ok(vector)
    }

    pub fn load_config(&self, cell_id: CellId) -> Result<ModelConfig> {
        read_json(&self.cell_dir(cell_id).join(MODEL_CONFIG_FILE))
    }

    /// Rebuild a cell's model, checking it against its recorded architecture.
    pub fn load_model(&self, cell_id: CellId) -> Result<(CellModel, ModelConfig)> {
        let config = self.load_config(cell_id)?;
        let path = self.cell_dir(cell_id).join(MODEL_FILE);
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let model: CellModel =
            bincode::deserialize(&bytes).map_err(|source| StoreError::Blob { path, source })?;

        let arch = model
            .validate()
            .map_err(|e| StoreError::InvalidData(format!("cell {cell_id}: {e}")))?;
        if arch != config.architecture() {
            return Err(StoreError::InvalidData(format!(
                "cell {cell_id}: parameters are {}→{}→{} but {MODEL_CONFIG_FILE} says {}→{}→{}",
                arch.input_dim,
                arch.hidden_dim,
                arch.output_dim,
                config.input_dim,
                config.hidden_dim,
                config.output_dim
            )));
        }
        Ok((model, config))
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|e| StoreError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_blob(path: &Path, model: &CellModel) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, model).map_err(|source| StoreError::Blob {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|e| StoreError::io(path, e))
}
