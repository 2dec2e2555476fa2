// Input layer — the source end of the graph
//
// Holds no math: its output tensor is written externally by
// NetworkGraph::set_inputs before each forward pass. It exists so the
// graph has a node to hang the model input dimension and tensor on.

use marten_core::{Result, TensorDim};

use crate::context::{InitContext, RunContext};
use crate::layer::Layer;

#[derive(Debug, Clone)]
pub struct InputLayer {
    dim: TensorDim,
}

impl InputLayer {
    pub fn new(dim: impl Into<TensorDim>) -> Self {
        InputLayer { dim: dim.into() }
    }
}

impl Layer for InputLayer {
    fn kind(&self) -> &'static str {
        "input"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        ctx.set_output_dims(vec![self.dim.clone()]);
        Ok(())
    }

    fn forward(&mut self, _ctx: &RunContext, _training: bool) -> Result<()> {
        // Data is fed externally into the output tensor.
        Ok(())
    }

    fn calc_derivative(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    fn set_batch(&mut self, batch: usize) {
        self.dim.set_batch(batch);
    }

    fn supports_backwarding(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
