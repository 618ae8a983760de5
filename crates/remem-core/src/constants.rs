/// Largest token value: two 6-bit base-64 indices packed into 12 bits.
pub const MAX_TOKEN: u16 = 4095;

/// Largest absolute context value accepted for fitting. Anything beyond it
/// overflows the f32 forward pass.
pub const MAX_CONTEXT_MAGNITUDE: f32 = 1.0e6;

/// Lower bound on the hidden width of a cell model.
pub const MIN_HIDDEN_DIM: usize = 128;

/// Fitting stops once the loss is at or below this value.
pub const DEFAULT_TARGET_LOSS: f64 = 1e-5;

/// Hard cap on fitting epochs per cell.
pub const DEFAULT_MAX_EPOCHS: usize = 2000;

/// Adam step size.
pub const DEFAULT_LEARNING_RATE: f32 = 0.01;

/// Adam first-moment decay.
pub const ADAM_BETA1: f32 = 0.9;

/// Adam second-moment decay.
pub const ADAM_BETA2: f32 = 0.999;

/// Adam denominator epsilon.
pub const ADAM_EPSILON: f32 = 1e-8;

/// Output width of the hash embedder when none is configured.
pub const DEFAULT_EMBED_DIM: usize = 256;

/// Similarity assigned when a vector has zero norm or lengths differ.
pub const NO_SIMILARITY: f64 = -1.0;
