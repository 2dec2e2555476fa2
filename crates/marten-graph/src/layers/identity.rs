// Identity layer — pure pass-through
//
// The simplest NonRestricted in-place candidate: output may alias
// input, and the derivative path may alias too.

use marten_core::Result;

use crate::context::{InitContext, RunContext};
use crate::layer::{InPlaceType, Layer};

#[derive(Debug, Clone, Default)]
pub struct IdentityLayer;

impl IdentityLayer {
    pub fn new() -> Self {
        IdentityLayer
    }
}

impl Layer for IdentityLayer {
    fn kind(&self) -> &'static str {
        "identity"
    }

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        let input = ctx.input_dim(0)?.clone();
        ctx.set_output_dims(vec![input]);
        Ok(())
    }

    fn forward(&mut self, ctx: &RunContext, _training: bool) -> Result<()> {
        ctx.output(0)?.assign(&ctx.input(0)?)
    }

    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()> {
        let incoming = ctx.incoming_derivative(0)?;
        let outgoing = ctx.outgoing_derivative(0)?;
        if outgoing.aliases(&incoming) {
            // In-place backward: the buffer already holds the value.
            return Ok(());
        }
        let d = incoming.read();
        let mut g = outgoing.write();
        for i in 0..g.len() {
            g[i] += d[i];
        }
        Ok(())
    }

    fn support_in_place(&self) -> InPlaceType {
        InPlaceType::NonRestricted
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
