// Initializer — weight initialization strategies
//
// Each weight request carries an Initializer; the tensor pool applies it
// exactly once, the first time the weight's storage is materialized.
// Re-allocation after a batch-size change never re-initializes weights.

use rand::Rng;

use crate::shape::TensorDim;

/// Fill strategy applied when a tensor's storage is first materialized.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Initializer {
    /// Leave the buffer zeroed. Default for activations and gradients.
    #[default]
    Zeros,
    Ones,
    Constant(f32),
    /// U(low, high)
    Uniform { low: f32, high: f32 },
    /// N(mean, std)
    Normal { mean: f32, std: f32 },
    /// Glorot uniform: U(-a, a), a = sqrt(6 / (fan_in + fan_out))
    XavierUniform,
    /// Glorot normal: N(0, sqrt(2 / (fan_in + fan_out)))
    XavierNormal,
    /// He uniform: U(-b, b), b = sqrt(6 / fan_in)
    HeUniform,
    /// He normal: N(0, sqrt(2 / fan_in))
    HeNormal,
    /// Skip initialization entirely (externally fed tensors).
    None,
}

/// Compute (fan_in, fan_out) from a shape.
///
/// - 1-D: fan_in = fan_out = dims[0]
/// - 2-D: fan_in = dims[0], fan_out = dims[1] (weight laid out [in, out])
/// - 3-D+: receptive field multiplies both fans.
fn compute_fans(dim: &TensorDim) -> (f64, f64) {
    let dims = dim.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[0] as f64, dims[1] as f64),
        _ => {
            let receptive: usize = dims[2..].iter().product();
            let fan_in = dims[0] as f64 * receptive as f64;
            let fan_out = dims[1] as f64 * receptive as f64;
            (fan_in, fan_out)
        }
    }
}

/// Sample N(0, 1) via Box-Muller from two uniform draws.
fn sample_standard_normal(rng: &mut impl Rng) -> f32 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

impl Initializer {
    /// Fill `data` in place according to this strategy and the tensor's shape.
    pub fn fill(&self, data: &mut [f32], dim: &TensorDim) {
        let mut rng = rand::thread_rng();
        let (fan_in, fan_out) = compute_fans(dim);
        match self {
            Initializer::Zeros => data.fill(0.0),
            Initializer::Ones => data.fill(1.0),
            Initializer::Constant(v) => data.fill(*v),
            Initializer::Uniform { low, high } => {
                for x in data.iter_mut() {
                    *x = rng.gen_range(*low..*high);
                }
            }
            Initializer::Normal { mean, std } => {
                for x in data.iter_mut() {
                    *x = mean + std * sample_standard_normal(&mut rng);
                }
            }
            Initializer::XavierUniform => {
                let a = (6.0 / (fan_in + fan_out)).sqrt() as f32;
                for x in data.iter_mut() {
                    *x = rng.gen_range(-a..a);
                }
            }
            Initializer::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt() as f32;
                for x in data.iter_mut() {
                    *x = std * sample_standard_normal(&mut rng);
                }
            }
            Initializer::HeUniform => {
                let b = (6.0 / fan_in).sqrt() as f32;
                for x in data.iter_mut() {
                    *x = rng.gen_range(-b..b);
                }
            }
            Initializer::HeNormal => {
                let std = (2.0 / fan_in).sqrt() as f32;
                for x in data.iter_mut() {
                    *x = std * sample_standard_normal(&mut rng);
                }
            }
            Initializer::None => {}
        }
    }
}
