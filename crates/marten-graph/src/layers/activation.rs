// Activation layer — elementwise, shape-preserving transforms
//
// Activations are the canonical in-place candidates: pure elementwise,
// single input, single output. The backward form is written in terms of
// the *output* value, so Restricted in-place execution (which destroys
// the input) stays differentiable.

use marten_core::{Error, Result};

use crate::context::{InitContext, RunContext};
use crate::layer::{InPlaceType, Layer};

/// Activation function tag. Also used to declare a fused activation on
/// another layer; compile splits those into a trailing activation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationType {
    /// No activation (nothing to realize).
    #[default]
    None,
    Relu,
    Sigmoid,
    Tanh,
}

impl ActivationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationType::None => "none",
            ActivationType::Relu => "relu",
            ActivationType::Sigmoid => "sigmoid",
            ActivationType::Tanh => "tanh",
        }
    }

    fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationType::None => x,
            ActivationType::Relu => x.max(0.0),
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the activation output y = f(x).
    fn derivative_from_output(&self, y: f32) -> f32 {
        match self {
            ActivationType::None => 1.0,
            ActivationType::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::Sigmoid => y * (1.0 - y),
            ActivationType::Tanh => 1.0 - y * y,
        }
    }
}

/// Standalone elementwise activation node.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    act: ActivationType,
}

impl ActivationLayer {
    pub fn new(act: ActivationType) -> Self {
        ActivationLayer { act }
    }

    pub fn activation(&self) -> ActivationType {
        self.act
    }
}

impl Layer for ActivationLayer {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        if self.act == ActivationType::None {
            return Err(Error::InvalidArgument(format!(
                "node '{}': activation layer requires a concrete activation type",
                ctx.node_name()
            )));
        }
        let input = ctx.input_dim(0)?.clone();
        ctx.set_output_dims(vec![input]);
        Ok(())
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        let input = ctx.input(0)?;
        let output = ctx.output(0)?;
        output.assign(&input)?;
        output.map_inplace(|x| self.act.apply(x));
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let output = ctx.output(0)?;
        let incoming = ctx.incoming_derivative(0)?;
        let outgoing = ctx.outgoing_derivative(0)?;
        let y = output.read();
        let d = incoming.read();
        let mut g = outgoing.write();
        for i in 0..g.len() {
            g[i] += d[i] * self.act.derivative_from_output(y[i]);
        }
        Ok(())
    }

    fn support_in_place(&self) -> InPlaceType {
        InPlaceType::Restricted
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
