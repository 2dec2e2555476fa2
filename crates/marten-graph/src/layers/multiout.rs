// MultiOut layer — explicit fan-out point
//
// Copies its single input to N outputs so each consumer gets its own
// connection; the backward pass sums the incoming derivatives. Fan-out
// through copies is never in-place-eligible by construction.

use marten_core::{Error, Result};

use crate::context::{InitContext, RunContext};
use crate::layer::Layer;

#[derive(Debug, Clone)]
pub struct MultiOutLayer {
    count: usize,
}

impl MultiOutLayer {
    pub fn new(count: usize) -> Self {
        MultiOutLayer { count }
    }
}

impl Layer for MultiOutLayer {
    fn kind(&self) -> &'static str {
        "multiout"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        if self.count < 2 {
            return Err(Error::InvalidArgument(format!(
                "node '{}': multiout needs at least 2 outputs, got {}",
                ctx.node_name(),
                self.count
            )));
        }
        let input = ctx.input_dim(0)?.clone();
        ctx.set_output_dims(vec![input; self.count]);
        Ok(())
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        let input = ctx.input(0)?;
        for i in 0..ctx.num_outputs() {
            ctx.output(i)?.assign(&input)?;
        }
        Ok(())
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let outgoing = ctx.outgoing_derivative(0)?;
        for i in 0..ctx.num_outputs() {
            let incoming = ctx.incoming_derivative(i)?;
            let d = incoming.read();
            let mut g = outgoing.write();
            for j in 0..g.len() {
                g[j] += d[j];
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
