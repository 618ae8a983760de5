//! Reconstructive memory cells.
//!
//! A cell keeps a context vector and a tiny network overfit to emit the
//! cell's token sequence when evaluated on that vector. Text is never stored;
//! it is rebuilt by evaluating the network and decoding its tokens.
//!
//! Zero I/O: codec, fitting and ranking only. Persistence lives in
//! `remem-store`.

pub mod cancel;
pub mod cell;
pub mod codec;
pub mod constants;
pub mod fit;
pub mod model;
pub mod signal;
pub mod similarity;

pub use cancel::CancelFlag;
pub use cell::{CellId, ParseCellIdError};
pub use codec::{DecodeError, TokenIter, decode, encode};
pub use constants::{
    DEFAULT_EMBED_DIM, DEFAULT_LEARNING_RATE, DEFAULT_MAX_EPOCHS, DEFAULT_TARGET_LOSS,
    MAX_CONTEXT_MAGNITUDE, MAX_TOKEN, MIN_HIDDEN_DIM,
};
pub use fit::{
    FitConfig, FitError, FitProgress, FitReport, FittedCell, fit_cell, fit_cell_observed,
};
pub use model::{Architecture, CellModel, Dense, ModelError, to_token};
pub use signal::{EmbeddingError, HashEmbedder, Signal, SignalEmbedder};
pub use similarity::{RankedCell, cosine, rank};
