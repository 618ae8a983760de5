pub mod config;
pub mod error;
pub mod memory;
pub mod recall;
pub mod store;

pub use config::{
    CELLS_DIR_ENV, CONFIG_ENV, Config, ConfigError, EmbeddingSection, FitSection, ProviderKind,
    StoreSection,
};
pub use error::{Result, StoreError};
pub use memory::{LearnReport, Memory, MemoryError};
pub use recall::{RecallEngine, RecallOutcome, RecallResult, ReconstructionError, TopCell};
pub use store::{CellStore, ModelConfig, StoredVector};
