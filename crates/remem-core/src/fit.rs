//! Fitting a cell model to exactly one (context, tokens) example.
//!
//! The network is deliberately overfit: batch size one, the same example
//! every epoch, Adam on mean-squared error. Fitting ends when the loss drops
//! to `target_loss` or after `max_epochs`, whichever comes first. Missing the
//! target is reported, not raised; the partially fit model is still returned.

use std::fmt;

use ndarray::{Array, Array1, Array2, ArrayView1, Dimension, Zip};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::constants::{
    ADAM_BETA1, ADAM_BETA2, ADAM_EPSILON, DEFAULT_LEARNING_RATE, DEFAULT_MAX_EPOCHS,
    DEFAULT_TARGET_LOSS, MAX_CONTEXT_MAGNITUDE, MAX_TOKEN,
};
use crate::model::{Architecture, CellModel, Trace};

#[derive(Clone, Debug, PartialEq)]
pub struct FitConfig {
    pub max_epochs: usize,
    pub target_loss: f64,
    pub learning_rate: f32,
    /// Parameter-init seed. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Progress callback cadence in epochs; 0 disables it.
    pub log_every: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_epochs: DEFAULT_MAX_EPOCHS,
            target_loss: DEFAULT_TARGET_LOSS,
            learning_rate: DEFAULT_LEARNING_RATE,
            seed: None,
            log_every: 100,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), FitError> {
        if self.max_epochs == 0 {
            return Err(FitError::InvalidConfig("max_epochs must be at least 1".into()));
        }
        if !(self.target_loss.is_finite() && self.target_loss >= 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "target_loss must be finite and non-negative, got {}",
                self.target_loss
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// What happened during a fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub max_epochs: usize,
    pub target_loss: f64,
    pub learning_rate: f32,
    pub actual_epochs: usize,
    /// Loss of the returned parameters.
    pub final_loss: f64,
    pub reached_target: bool,
}

#[derive(Clone, Debug)]
pub struct FittedCell {
    pub model: CellModel,
    pub report: FitReport,
}

/// Periodic progress handed to the observer passed to [`fit_cell_observed`].
#[derive(Clone, Copy, Debug)]
pub struct FitProgress {
    pub epoch: usize,
    pub max_epochs: usize,
    pub loss: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    EmptyContext,
    EmptyTokens,
    NonFiniteContext { index: usize },
    ContextOutOfRange { index: usize, value: f32 },
    TokenOutOfRange { index: usize, token: u16 },
    InvalidConfig(String),
    /// Loss overflowed. Bounded contexts keep this out of reach in practice.
    Diverged { epoch: usize },
    Cancelled { epochs: usize },
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitError::EmptyContext => write!(f, "context vector is empty"),
            FitError::EmptyTokens => write!(f, "token sequence is empty"),
            FitError::NonFiniteContext { index } => {
                write!(f, "context vector value at index {index} is not finite")
            }
            FitError::ContextOutOfRange { index, value } => write!(
                f,
                "context vector value {value} at index {index} exceeds ±{MAX_CONTEXT_MAGNITUDE}"
            ),
            FitError::TokenOutOfRange { index, token } => {
                write!(f, "token {token} at index {index} exceeds {MAX_TOKEN}")
            }
            FitError::InvalidConfig(msg) => write!(f, "invalid fit config: {msg}"),
            FitError::Diverged { epoch } => write!(f, "loss diverged at epoch {epoch}"),
            FitError::Cancelled { epochs } => write!(f, "fit cancelled after {epochs} epochs"),
        }
    }
}

impl std::error::Error for FitError {}

fn validate_example(context: &[f32], tokens: &[u16]) -> Result<(), FitError> {
    if context.is_empty() {
        return Err(FitError::EmptyContext);
    }
    if tokens.is_empty() {
        return Err(FitError::EmptyTokens);
    }
    if let Some(index) = context.iter().position(|v| !v.is_finite()) {
        return Err(FitError::NonFiniteContext { index });
    }
    if let Some((index, &value)) = context
        .iter()
        .enumerate()
        .find(|(_, v)| v.abs() > MAX_CONTEXT_MAGNITUDE)
    {
        return Err(FitError::ContextOutOfRange { index, value });
    }
    if let Some((index, &token)) = tokens.iter().enumerate().find(|(_, t)| **t > MAX_TOKEN) {
        return Err(FitError::TokenOutOfRange { index, token });
    }
    Ok(())
}

/// Fit a fresh model so that `model(context) ≈ tokens`.
pub fn fit_cell(
    context: &[f32],
    tokens: &[u16],
    config: &FitConfig,
    cancel: &CancelFlag,
) -> Result<FittedCell, FitError> {
    fit_cell_observed(context, tokens, config, cancel, |_| {})
}

/// [`fit_cell`] with a progress observer, called on the first epoch and then
/// every `config.log_every` epochs.
pub fn fit_cell_observed(
    context: &[f32],
    tokens: &[u16],
    config: &FitConfig,
    cancel: &CancelFlag,
    mut observe: impl FnMut(FitProgress),
) -> Result<FittedCell, FitError> {
    config.validate()?;
    validate_example(context, tokens)?;

    let mut rng = match config.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };
    let arch = Architecture::for_cell(context.len(), tokens.len());
    let mut model = CellModel::new(arch, &mut rng);
    let mut adam = Adam::new(&model, config.learning_rate);

    let x = ArrayView1::from(context);
    let y: Array1<f32> = tokens.iter().map(|&t| t as f32).collect();

    let mut actual_epochs = 0;
    let mut final_loss = f64::INFINITY;
    let mut reached_target = false;

    for epoch in 1..=config.max_epochs {
        if cancel.is_cancelled() {
            return Err(FitError::Cancelled {
                epochs: actual_epochs,
            });
        }

        let trace = model.trace(x);
        let loss = mse(&trace.output, &y);
        actual_epochs = epoch;
        final_loss = loss;

        if !loss.is_finite() {
            return Err(FitError::Diverged { epoch });
        }
        if loss <= config.target_loss {
            reached_target = true;
            break;
        }
        if config.log_every > 0 && (epoch == 1 || epoch % config.log_every == 0) {
            observe(FitProgress {
                epoch,
                max_epochs: config.max_epochs,
                loss,
            });
        }

        let grads = gradients(&model, x, &trace, &y);
        adam.step(&mut model, &grads);
    }

    if !reached_target {
        // The last step moved the parameters past the last measured loss.
        final_loss = mse(&model.trace(x).output, &y);
        if !final_loss.is_finite() {
            return Err(FitError::Diverged {
                epoch: actual_epochs,
            });
        }
        reached_target = final_loss <= config.target_loss;
    }

    Ok(FittedCell {
        model,
        report: FitReport {
            max_epochs: config.max_epochs,
            target_loss: config.target_loss,
            learning_rate: config.learning_rate,
            actual_epochs,
            final_loss,
            reached_target,
        },
    })
}

fn mse(output: &Array1<f32>, target: &Array1<f32>) -> f64 {
    let sum: f64 = output
        .iter()
        .zip(target)
        .map(|(&o, &t)| {
            let d = (o - t) as f64;
            d * d
        })
        .sum();
    sum / target.len() as f64
}

fn outer(a: &Array1<f32>, b: ArrayView1<'_, f32>) -> Array2<f32> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

fn relu_grad(upstream: Array1<f32>, z: &Array1<f32>) -> Array1<f32> {
    let mut out = upstream;
    Zip::from(&mut out).and(z).for_each(|g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

/// Backprop of the MSE loss through the three layers.
fn gradients(
    model: &CellModel,
    x: ArrayView1<'_, f32>,
    trace: &Trace,
    target: &Array1<f32>,
) -> CellModel {
    let scale = 2.0 / target.len() as f32;
    let dy = (&trace.output - target) * scale;

    let dz2 = relu_grad(model.output.weight.t().dot(&dy), &trace.z2);
    let dz1 = relu_grad(model.hidden.weight.t().dot(&dz2), &trace.z1);

    let mut grads = model.zeros_like();
    grads.output.weight = outer(&dy, trace.h2.view());
    grads.hidden.weight = outer(&dz2, trace.h1.view());
    grads.input.weight = outer(&dz1, x);
    grads.output.bias = dy;
    grads.hidden.bias = dz2;
    grads.input.bias = dz1;
    grads
}

/// Adam over every tensor of a [`CellModel`].
///
/// Moments are kept in model-shaped buffers:
/// 1. m = β1·m + (1 − β1)·g
/// 2. v = β2·v + (1 − β2)·g²
/// 3. p -= lr · (m / (1 − β1ᵗ)) / (sqrt(v / (1 − β2ᵗ)) + ε)
struct Adam {
    learning_rate: f32,
    t: i32,
    m: CellModel,
    v: CellModel,
}

struct AdamCoefficients {
    learning_rate: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl Adam {
    fn new(model: &CellModel, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            t: 0,
            m: model.zeros_like(),
            v: model.zeros_like(),
        }
    }

    fn step(&mut self, model: &mut CellModel, grads: &CellModel) {
        self.t = self.t.saturating_add(1);
        let coeff = AdamCoefficients {
            learning_rate: self.learning_rate,
            bias_correction1: 1.0 - ADAM_BETA1.powi(self.t),
            bias_correction2: 1.0 - ADAM_BETA2.powi(self.t),
        };

        let layers = model.layers_mut();
        let grads = grads.layers();
        let m = self.m.layers_mut();
        let v = self.v.layers_mut();
        for (((p, g), m), v) in layers.into_iter().zip(grads).zip(m).zip(v) {
            update(&mut p.weight, &g.weight, &mut m.weight, &mut v.weight, &coeff);
            update(&mut p.bias, &g.bias, &mut m.bias, &mut v.bias, &coeff);
        }
    }
}

fn update<D: Dimension>(
    params: &mut Array<f32, D>,
    grads: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    c: &AdamCoefficients,
) {
    Zip::from(params)
        .and(grads)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = *m / c.bias_correction1;
            let v_hat = *v / c.bias_correction2;
            *p -= c.learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_epochs: usize) -> FitConfig {
        FitConfig {
            max_epochs,
            seed: Some(42),
            ..FitConfig::default()
        }
    }

    fn loss_of(model: &CellModel, context: &[f32], tokens: &[u16]) -> f64 {
        let y: Array1<f32> = tokens.iter().map(|&t| t as f32).collect();
        mse(&model.trace(ArrayView1::from(context)).output, &y)
    }

    #[test]
    fn test_two_token_example() {
        let context = [1.0, 0.0];
        let tokens = [10, 20];
        let fitted = fit_cell(&context, &tokens, &config(2000), &CancelFlag::new()).unwrap();
        let report = &fitted.report;

        assert!(report.actual_epochs >= 1 && report.actual_epochs <= 2000);
        assert_eq!(report.max_epochs, 2000);
        assert_eq!(report.target_loss, 1e-5);
        assert_eq!(report.final_loss, loss_of(&fitted.model, &context, &tokens));
        assert!(report.reached_target);
        assert!(report.final_loss <= 1e-5);
        assert_eq!(fitted.model.reconstruct_tokens(&context).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_architecture_follows_example() {
        let fitted = fit_cell(&[0.5; 6], &[1, 2, 3], &config(1), &CancelFlag::new()).unwrap();
        assert_eq!(
            fitted.model.architecture(),
            Architecture {
                input_dim: 6,
                hidden_dim: 128,
                output_dim: 3
            }
        );
    }

    #[test]
    fn test_stops_at_epoch_cap() {
        let fitted = fit_cell(
            &[0.3, -0.2, 0.9],
            &[4000, 17, 2048, 999],
            &config(5),
            &CancelFlag::new(),
        )
        .unwrap();
        assert!(fitted.report.actual_epochs <= 5);
        assert!(!fitted.report.reached_target);
        assert!(fitted.report.final_loss > 1e-5);
    }

    #[test]
    fn test_loss_decreases_over_training() {
        let context = [0.3, -0.2, 0.9, 0.1];
        let tokens = [100, 200, 300];
        let short = fit_cell(&context, &tokens, &config(1), &CancelFlag::new()).unwrap();
        let long = fit_cell(&context, &tokens, &config(300), &CancelFlag::new()).unwrap();
        assert!(long.report.final_loss < short.report.final_loss);
    }

    #[test]
    fn test_seeded_fit_is_reproducible() {
        let a = fit_cell(&[1.0, 2.0], &[5, 6], &config(20), &CancelFlag::new()).unwrap();
        let b = fit_cell(&[1.0, 2.0], &[5, 6], &config(20), &CancelFlag::new()).unwrap();
        assert_eq!(a.model, b.model);
        assert_eq!(a.report, b.report);
    }

    #[test]
    fn test_malformed_inputs() {
        let cancel = CancelFlag::new();
        let cfg = config(10);
        assert_eq!(
            fit_cell(&[], &[1], &cfg, &cancel).unwrap_err(),
            FitError::EmptyContext
        );
        assert_eq!(
            fit_cell(&[1.0], &[], &cfg, &cancel).unwrap_err(),
            FitError::EmptyTokens
        );
        assert_eq!(
            fit_cell(&[1.0, f32::NAN], &[1], &cfg, &cancel).unwrap_err(),
            FitError::NonFiniteContext { index: 1 }
        );
        assert_eq!(
            fit_cell(&[1.0, f32::INFINITY], &[1], &cfg, &cancel).unwrap_err(),
            FitError::NonFiniteContext { index: 1 }
        );
        assert_eq!(
            fit_cell(&[3.0e38, 3.0e38], &[10, 20], &cfg, &cancel).unwrap_err(),
            FitError::ContextOutOfRange {
                index: 0,
                value: 3.0e38
            }
        );
        assert_eq!(
            fit_cell(&[1.0], &[3, 4096], &cfg, &cancel).unwrap_err(),
            FitError::TokenOutOfRange {
                index: 1,
                token: 4096
            }
        );
    }

    #[test]
    fn test_invalid_config() {
        let cancel = CancelFlag::new();
        for cfg in [
            config(0),
            FitConfig {
                target_loss: -1.0,
                ..config(10)
            },
            FitConfig {
                learning_rate: 0.0,
                ..config(10)
            },
        ] {
            assert!(matches!(
                fit_cell(&[1.0], &[1], &cfg, &cancel),
                Err(FitError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert_eq!(
            fit_cell(&[1.0], &[1], &config(10), &cancel).unwrap_err(),
            FitError::Cancelled { epochs: 0 }
        );
    }

    #[test]
    fn test_cancelled_mid_fit() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let cfg = FitConfig {
            log_every: 1,
            ..config(1000)
        };
        let err = fit_cell_observed(&[1.0, 0.5], &[4000, 3000], &cfg, &cancel, |p| {
            if p.epoch == 3 {
                trigger.cancel();
            }
        })
        .unwrap_err();
        assert_eq!(err, FitError::Cancelled { epochs: 3 });
    }

    #[test]
    fn test_observer_cadence() {
        let cfg = FitConfig {
            log_every: 10,
            target_loss: 0.0,
            ..config(35)
        };
        let mut seen = Vec::new();
        fit_cell_observed(&[1.0], &[4000], &cfg, &CancelFlag::new(), |p| seen.push(p.epoch))
            .unwrap();
        assert_eq!(seen, vec![1, 10, 20, 30]);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = SmallRng::seed_from_u64(7);
        let arch = Architecture {
            input_dim: 3,
            hidden_dim: 4,
            output_dim: 2,
        };
        let model = CellModel::new(arch, &mut rng);
        let context = [0.8f32, -0.4, 0.6];
        let x = ArrayView1::from(&context[..]);
        let y = Array1::from(vec![0.5f32, -0.3]);

        let trace = model.trace(x);
        let grads = gradients(&model, x, &trace, &y);

        let loss_at = |m: &CellModel| mse(&m.trace(x).output, &y);
        let h = 1e-3f32;
        let check = |analytic: f32, perturb: &dyn Fn(&mut CellModel, f32)| {
            let mut plus = model.clone();
            perturb(&mut plus, h);
            let mut minus = model.clone();
            perturb(&mut minus, -h);
            let numeric = (loss_at(&plus) - loss_at(&minus)) / (2.0 * h as f64);
            assert!(
                (numeric - analytic as f64).abs() < 1e-2,
                "numeric {numeric} vs analytic {analytic}"
            );
        };

        check(grads.output.weight[[1, 2]], &|m, d| m.output.weight[[1, 2]] += d);
        check(grads.output.bias[0], &|m, d| m.output.bias[0] += d);
        check(grads.hidden.weight[[0, 3]], &|m, d| m.hidden.weight[[0, 3]] += d);
        check(grads.hidden.bias[2], &|m, d| m.hidden.bias[2] += d);
        check(grads.input.weight[[3, 1]], &|m, d| m.input.weight[[3, 1]] += d);
        check(grads.input.bias[1], &|m, d| m.input.bias[1] += d);
    }
}
