// Loss layers — terminal nodes that consume the label
//
// A loss node produces a per-sample [batch, 1] output (the engine
// averages it into the reported loss) and starts the backward chain:
// its calc_derivative writes dLoss/dPred into the outgoing derivative,
// already scaled so the whole-batch mean differentiates correctly.
// Cross entropy fuses the softmax so the derivative is the numerically
// stable (softmax(p) - l) / batch.

use marten_core::{bail, Error, Result, TensorDim};

use crate::context::{InitContext, RunContext};
use crate::layer::Layer;

/// Loss selection for [`crate::network::NetworkGraph::compile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    Mse,
    CrossEntropy,
}

impl LossType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossType::Mse => "mse",
            LossType::CrossEntropy => "cross_entropy",
        }
    }

    pub(crate) fn build(&self) -> Box<dyn Layer> {
        match self {
            LossType::Mse => Box::new(MseLossLayer::new()),
            LossType::CrossEntropy => Box::new(CrossEntropyLossLayer::new()),
        }
    }
}

fn finalize_loss(ctx: &mut InitContext) -> Result<()> {
    if ctx.num_inputs() != 1 {
        return Err(Error::InvalidArgument(format!(
            "node '{}': loss takes exactly one input, got {}",
            ctx.node_name(),
            ctx.num_inputs()
        )));
    }
    let batch = ctx.input_dim(0)?.batch();
    ctx.set_output_dims(vec![TensorDim::new(vec![batch, 1])]);
    Ok(())
}

/// Mean squared error: mean over all elements of (pred - label)^2.
#[derive(Debug, Clone, Default)]
pub struct MseLossLayer;

impl MseLossLayer {
    pub fn new() -> Self {
        MseLossLayer
    }
}

impl Layer for MseLossLayer {
    fn kind(&self) -> &'static str {
        "mse_loss"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        finalize_loss(ctx)
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        let pred = ctx.input(0)?;
        let label = ctx.label()?;
        let output = ctx.output(0)?;

        let dim = pred.dim().clone();
        let batch = dim.batch();
        let width = dim.feature_len();

        let p = pred.read();
        let l = label.read();
        if p.len() != l.len() {
            bail!(
                "mse loss: prediction has {} elements, label has {}",
                p.len(),
                l.len()
            );
        }
        let mut out = output.write();
        for row in 0..batch {
            let base = row * width;
            let mut acc = 0.0;
            for j in 0..width {
                let diff = p[base + j] - l[base + j];
                acc += diff * diff;
            }
            out[row] = acc / width as f32;
        }
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let pred = ctx.input(0)?;
        let label = ctx.label()?;
        let outgoing = ctx.outgoing_derivative(0)?;

        let p = pred.read();
        let l = label.read();
        let mut g = outgoing.write();
        let n = p.len() as f32;
        for i in 0..g.len() {
            g[i] += 2.0 * (p[i] - l[i]) / n;
        }
        Ok(())
    }

    fn requires_label(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// Softmax cross entropy over the feature axis, averaged over the batch.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLossLayer;

impl CrossEntropyLossLayer {
    pub fn new() -> Self {
        CrossEntropyLossLayer
    }

    /// Row-wise softmax with the usual max subtraction.
    fn softmax_row(row: &[f32], out: &mut [f32]) {
        let mut max = f32::NEG_INFINITY;
        for &x in row {
            if x > max {
                max = x;
            }
        }
        let mut sum = 0.0;
        for (o, &x) in out.iter_mut().zip(row) {
            let e = (x - max).exp();
            *o = e;
            sum += e;
        }
        for o in out.iter_mut() {
            *o /= sum;
        }
    }
}

impl Layer for CrossEntropyLossLayer {
    fn kind(&self) -> &'static str {
        "cross_entropy_loss"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        finalize_loss(ctx)
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        let pred = ctx.input(0)?;
        let label = ctx.label()?;
        let output = ctx.output(0)?;

        let dim = pred.dim().clone();
        let batch = dim.batch();
        let width = dim.feature_len();

        let p = pred.read();
        let l = label.read();
        if p.len() != l.len() {
            bail!(
                "cross entropy loss: prediction has {} elements, label has {}",
                p.len(),
                l.len()
            );
        }

        let mut out = output.write();
        let mut sm = vec![0.0f32; width];
        for row in 0..batch {
            let base = row * width;
            Self::softmax_row(&p[base..base + width], &mut sm);
            let mut acc = 0.0;
            for j in 0..width {
                if l[base + j] != 0.0 {
                    acc -= l[base + j] * sm[j].max(f32::MIN_POSITIVE).ln();
                }
            }
            out[row] = acc;
        }
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let pred = ctx.input(0)?;
        let label = ctx.label()?;
        let outgoing = ctx.outgoing_derivative(0)?;

        let dim = pred.dim().clone();
        let batch = dim.batch();
        let width = dim.feature_len();

        let p = pred.read();
        let l = label.read();
        let mut g = outgoing.write();

        let mut sm = vec![0.0f32; width];
        let scale = 1.0 / batch as f32;
        for row in 0..batch {
            let base = row * width;
            Self::softmax_row(&p[base..base + width], &mut sm);
            for j in 0..width {
                g[base + j] += (sm[j] - l[base + j]) * scale;
            }
        }
        Ok(())
    }

    fn requires_label(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
