// Layer trait — the compute contract every graph node fulfills
//
// The engine never looks inside a layer's math. It drives exactly five
// entry points: finalize (shape inference + tensor requests), forward,
// calc_derivative, calc_gradient, and set_batch. Dispatch is a single
// trait object at the node seam; there is no layer class hierarchy.

use marten_core::Result;

use crate::context::{InitContext, RunContext};

/// In-place eligibility a layer can advertise for itself.
///
/// The node wrapper still vetoes in-place execution when the node has
/// more than one consumer: with fan-out the input buffer may be read by
/// other consumers after this node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InPlaceType {
    /// Never executes in place.
    #[default]
    None,
    /// Output may share input storage, but derivative buffers stay
    /// separate (the backward computation still reads the output).
    Restricted,
    /// Output and derivative buffers may both share their input
    /// counterparts (pure pass-through layers).
    NonRestricted,
}

/// The contract consumed from layer implementations.
///
/// Errors from any entry point are fatal to the enclosing
/// compile/initialize/forward/backward call; the engine never retries.
pub trait Layer {
    /// Stable type tag (e.g. `"fully_connected"`).
    fn kind(&self) -> &'static str;

    /// Infer output shapes from input shapes and request weights and
    /// scratch tensors. The single point where shape-inference and
    /// unsupported-configuration errors surface.
    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()>;

    /// Compute declared outputs from resolved inputs.
    fn forward(&mut self, ctx: &RunContext, training: bool) -> Result<()>;

    /// Accumulate the derivative w.r.t. each input into the outgoing
    /// derivative buffers.
    fn calc_derivative(&mut self, ctx: &RunContext) -> Result<()>;

    /// Accumulate gradients w.r.t. this layer's weights.
    fn calc_gradient(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Notification that the batch size changed; shape bookkeeping is
    /// done by the pool, so most layers need nothing here.
    fn set_batch(&mut self, _batch: usize) {}

    /// Whether this layer participates in the backward pass at all.
    /// Source layers (model inputs) return false.
    fn supports_backwarding(&self) -> bool {
        true
    }

    /// Whether this layer is a terminal loss and consumes a label.
    fn requires_label(&self) -> bool {
        false
    }

    /// In-place capability of this layer's own computation.
    fn support_in_place(&self) -> InPlaceType {
        InPlaceType::None
    }

    /// Clone into a boxed trait object (graph copies, subgraph splicing).
    fn clone_box(&self) -> Box<dyn Layer>;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
