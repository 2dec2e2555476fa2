// InitContext / RunContext — what a layer sees at finalize and at run time
//
// InitContext is the shape-inference surface: resolved input dims go
// in, inferred output dims and tensor requests come out. The engine
// turns the requests into pool entries after finalize returns.
//
// RunContext is the execution surface: it holds pool handles, never
// tensors, and resolves them through the arena on each access. Nodes
// therefore never own storage and cannot keep a stale view across a
// reallocation.

use std::cell::RefCell;
use std::rc::Rc;

use marten_core::{Error, Initializer, Result, Tensor, TensorDim};

use crate::pool::{TensorId, TensorLifespan, TensorPool};

/// A weight the layer wants, recorded during finalize.
#[derive(Debug, Clone)]
pub struct WeightRequest {
    pub name: String,
    pub dim: TensorDim,
    pub init: Initializer,
    pub trainable: bool,
}

/// A private scratch tensor the layer wants, recorded during finalize.
#[derive(Debug, Clone)]
pub struct TensorRequest {
    pub name: String,
    pub dim: TensorDim,
    pub lifespan: TensorLifespan,
    pub init: Initializer,
}

/// Shape-inference context handed to [`crate::layer::Layer::finalize`].
#[derive(Debug, Clone)]
pub struct InitContext {
    node_name: String,
    input_dims: Vec<TensorDim>,
    output_dims: Vec<TensorDim>,
    weight_requests: Vec<WeightRequest>,
    tensor_requests: Vec<TensorRequest>,
}

impl InitContext {
    pub fn new(node_name: impl Into<String>, input_dims: Vec<TensorDim>) -> Self {
        InitContext {
            node_name: node_name.into(),
            input_dims,
            output_dims: Vec::new(),
            weight_requests: Vec::new(),
            tensor_requests: Vec::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn num_inputs(&self) -> usize {
        self.input_dims.len()
    }

    pub fn input_dims(&self) -> &[TensorDim] {
        &self.input_dims
    }

    pub fn input_dim(&self, i: usize) -> Result<&TensorDim> {
        self.input_dims.get(i).ok_or_else(|| {
            Error::msg(format!(
                "node '{}': input {} requested but only {} resolved",
                self.node_name,
                i,
                self.input_dims.len()
            ))
        })
    }

    /// Declare the node's output shapes. Called by the layer from
    /// finalize; this is the result of shape inference.
    pub fn set_output_dims(&mut self, dims: Vec<TensorDim>) {
        self.output_dims = dims;
    }

    pub fn output_dims(&self) -> &[TensorDim] {
        &self.output_dims
    }

    /// Request a trainable (or frozen) weight. Weight names are scoped
    /// under the node name.
    pub fn request_weight(
        &mut self,
        suffix: &str,
        dim: TensorDim,
        init: Initializer,
        trainable: bool,
    ) {
        self.weight_requests.push(WeightRequest {
            name: format!("{}:{}", self.node_name, suffix),
            dim,
            init,
            trainable,
        });
    }

    /// Request a layer-private scratch tensor.
    pub fn request_tensor(
        &mut self,
        suffix: &str,
        dim: TensorDim,
        lifespan: TensorLifespan,
        init: Initializer,
    ) {
        self.tensor_requests.push(TensorRequest {
            name: format!("{}:{}", self.node_name, suffix),
            dim,
            lifespan,
            init,
        });
    }

    pub fn weight_requests(&self) -> &[WeightRequest] {
        &self.weight_requests
    }

    pub fn tensor_requests(&self) -> &[TensorRequest] {
        &self.tensor_requests
    }
}

/// Execution context handed to forward/backward calls.
///
/// Holds arena handles only; every access resolves through the pool.
#[derive(Clone)]
pub struct RunContext {
    pool: Rc<RefCell<TensorPool>>,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    /// Derivative this node produces w.r.t. each input (read by the
    /// predecessor as its incoming derivative).
    pub(crate) input_grads: Vec<TensorId>,
    /// Derivative received w.r.t. each output.
    pub(crate) output_grads: Vec<TensorId>,
    pub(crate) weights: Vec<TensorId>,
    pub(crate) weight_grads: Vec<TensorId>,
    pub(crate) tensors: Vec<TensorId>,
    pub(crate) label: Option<TensorId>,
}

impl RunContext {
    pub fn new(pool: Rc<RefCell<TensorPool>>) -> Self {
        RunContext {
            pool,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_grads: Vec::new(),
            output_grads: Vec::new(),
            weights: Vec::new(),
            weight_grads: Vec::new(),
            tensors: Vec::new(),
            label: None,
        }
    }

    fn resolve(&self, id: TensorId) -> Result<Tensor> {
        self.pool.borrow().tensor(id)
    }

    fn resolve_at(&self, ids: &[TensorId], i: usize, what: &str) -> Result<Tensor> {
        let id = *ids
            .get(i)
            .ok_or_else(|| Error::msg(format!("{} {} out of range ({})", what, i, ids.len())))?;
        self.resolve(id)
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    pub fn input(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.inputs, i, "input")
    }

    pub fn output(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.outputs, i, "output")
    }

    /// Derivative w.r.t. output `i`, produced by this node's consumers.
    pub fn incoming_derivative(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.output_grads, i, "incoming derivative")
    }

    /// Derivative w.r.t. input `i`, produced here, consumed upstream.
    ///
    /// Backward implementations must accumulate (`+=`) into this
    /// buffer: with fan-out, several consumers contribute to the same
    /// derivative. The engine zeroes these buffers before each
    /// backward pass.
    pub fn outgoing_derivative(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.input_grads, i, "outgoing derivative")
    }

    pub fn weight(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.weights, i, "weight")
    }

    pub fn weight_grad(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.weight_grads, i, "weight gradient")
    }

    /// Layer-private scratch tensor `i`.
    pub fn tensor(&self, i: usize) -> Result<Tensor> {
        self.resolve_at(&self.tensors, i, "tensor")
    }

    /// The label tensor, present on label-bearing (loss) nodes only.
    pub fn label(&self) -> Result<Tensor> {
        let id = self
            .label
            .ok_or_else(|| Error::msg("node has no label tensor"))?;
        self.resolve(id)
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    pub(crate) fn weight_ids(&self) -> &[TensorId] {
        &self.weights
    }

    pub(crate) fn output_ids(&self) -> &[TensorId] {
        &self.outputs
    }

    pub(crate) fn input_grad_ids(&self) -> &[TensorId] {
        &self.input_grads
    }
}
