// Fully connected layer — out = in · W + b
//
// Weight is [in_features, units], bias is [1, units]. All three
// backward products are plain accumulating loops over the flattened
// batch; input rank beyond 2 is treated as [batch, feature_len].

use marten_core::{Error, Initializer, Result, TensorDim};

use crate::context::{InitContext, RunContext};
use crate::layer::Layer;

#[derive(Debug, Clone)]
pub struct FullyConnectedLayer {
    units: usize,
    in_features: usize,
}

impl FullyConnectedLayer {
    pub fn new(units: usize) -> Self {
        FullyConnectedLayer {
            units,
            in_features: 0,
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }
}

impl Layer for FullyConnectedLayer {
    fn kind(&self) -> &'static str {
        "fully_connected"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        if self.units == 0 {
            return Err(Error::InvalidArgument(format!(
                "node '{}': fully_connected needs units > 0",
                ctx.node_name()
            )));
        }
        let input = ctx.input_dim(0)?.clone();
        self.in_features = input.feature_len();
        if self.in_features == 0 {
            return Err(Error::InvalidArgument(format!(
                "node '{}': input has no features ({})",
                ctx.node_name(),
                input
            )));
        }

        ctx.request_weight(
            "weight",
            TensorDim::new(vec![self.in_features, self.units]),
            Initializer::XavierUniform,
            true,
        );
        ctx.request_weight(
            "bias",
            TensorDim::new(vec![1, self.units]),
            Initializer::Zeros,
            true,
        );

        ctx.set_output_dims(vec![TensorDim::new(vec![input.batch(), self.units])]);
        Ok(())
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        let input = ctx.input(0)?;
        let output = ctx.output(0)?;
        let weight = ctx.weight(0)?;
        let bias = ctx.weight(1)?;

        let batch = input.dim().batch();
        let (k, n) = (self.in_features, self.units);

        let x = input.read();
        let w = weight.read();
        let b = bias.read();
        let mut y = output.write();

        for row in 0..batch {
            for j in 0..n {
                let mut acc = b[j];
                for i in 0..k {
                    acc += x[row * k + i] * w[i * n + j];
                }
                y[row * n + j] = acc;
            }
        }
        Ok(())
    }

    fn calc_gradient(&mut self, ctx: &RunContext) -> Result<()> {
        let input = ctx.input(0)?;
        let incoming = ctx.incoming_derivative(0)?;
        let weight_grad = ctx.weight_grad(0)?;
        let bias_grad = ctx.weight_grad(1)?;

        let batch = input.dim().batch();
        let (k, n) = (self.in_features, self.units);

        let x = input.read();
        let d = incoming.read();

        {
            let mut wg = weight_grad.write();
            for i in 0..k {
                for j in 0..n {
                    let mut acc = 0.0;
                    for row in 0..batch {
                        acc += x[row * k + i] * d[row * n + j];
                    }
                    wg[i * n + j] += acc;
                }
            }
        }
        {
            let mut bg = bias_grad.write();
            for j in 0..n {
                let mut acc = 0.0;
                for row in 0..batch {
                    acc += d[row * n + j];
                }
                bg[j] += acc;
            }
        }
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let incoming = ctx.incoming_derivative(0)?;
        let outgoing = ctx.outgoing_derivative(0)?;
        let weight = ctx.weight(0)?;

        let batch = incoming.dim().batch();
        let (k, n) = (self.in_features, self.units);

        let d = incoming.read();
        let w = weight.read();
        let mut g = outgoing.write();

        for row in 0..batch {
            for i in 0..k {
                let mut acc = 0.0;
                for j in 0..n {
                    acc += d[row * n + j] * w[i * n + j];
                }
                g[row * k + i] += acc;
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
