//! Semantic signals and the embedding capability.

use std::fmt;
use std::sync::LazyLock;

use blake2::digest::consts::U8;
use blake2::{Blake2s, Digest};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_EMBED_DIM;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\w\-\x{0400}-\x{04FF}]+").unwrap());

/// What a cell is keyed by: free text or a keyword list.
///
/// Deserializes from either a JSON string or an array of strings, so dataset
/// records can use whichever shape they like.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Text(String),
    Keywords(Vec<String>),
}

impl Signal {
    /// The text handed to an embedder. Keywords are space-joined, empty ones skipped.
    pub fn joined(&self) -> String {
        match self {
            Signal::Text(text) => text.clone(),
            Signal::Keywords(words) => words
                .iter()
                .filter(|w| !w.is_empty())
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Signal::Text(text) => text.trim().is_empty(),
            Signal::Keywords(words) => words.iter().all(|w| w.trim().is_empty()),
        }
    }
}

impl From<&str> for Signal {
    fn from(text: &str) -> Self {
        Signal::Text(text.to_string())
    }
}

impl From<String> for Signal {
    fn from(text: String) -> Self {
        Signal::Text(text)
    }
}

impl From<Vec<String>> for Signal {
    fn from(words: Vec<String>) -> Self {
        Signal::Keywords(words)
    }
}

impl From<&[&str]> for Signal {
    fn from(words: &[&str]) -> Self {
        Signal::Keywords(words.iter().map(|w| w.to_string()).collect())
    }
}

#[derive(Debug)]
pub enum EmbeddingError {
    Provider { provider: String, message: String },
    DimensionMismatch { expected: usize, actual: usize },
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingError::Provider { provider, message } => {
                write!(f, "embedding provider {provider} failed: {message}")
            }
            EmbeddingError::DimensionMismatch { expected, actual } => {
                write!(f, "embedding has {actual} dimensions, expected {expected}")
            }
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// Maps a signal to a fixed-length context vector.
///
/// Output need not be normalized; similarity normalizes on its own.
pub trait SignalEmbedder: Send + Sync {
    fn embed(&self, signal: &Signal) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Deterministic bag-of-words histogram.
///
/// Each lowercase word is hashed with BLAKE2s (8-byte digest) and the
/// little-endian digest modulo the dimension picks the bucket to increment.
/// Not semantic beyond shared words, but stable across runs and platforms,
/// and it never fails.
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        for m in WORD.find_iter(&lowered) {
            v[bucket(m.as_str(), self.dimensions)] += 1.0;
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBED_DIM)
    }
}

impl SignalEmbedder for HashEmbedder {
    fn embed(&self, signal: &Signal) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(&signal.joined()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hash"
    }
}

fn bucket(word: &str, dimensions: usize) -> usize {
    let digest = Blake2s::<U8>::digest(word.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest);
    (u64::from_le_bytes(buf) % dimensions as u64) as usize
}
