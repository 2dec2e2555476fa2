// LayerNode — adapts a layer into the graph container's node contract
//
// The node owns identity, connectivity, and scheduling state; the layer
// owns the math. Input connections are declared by name (or left empty,
// meaning "previous node in declaration order" — resolved at compile
// time); output consumers are derived, never declared.

use marten_core::{Error, Result};

use crate::context::{InitContext, RunContext};
use crate::graph::GraphNode;
use crate::layer::{InPlaceType, Layer};
use crate::layers::activation::ActivationType;

/// Execution positions assigned to a node at compile time.
///
/// The backward pass is split into its gradient, derivative, and
/// gradient-apply steps so that tensor last-access detection is exact:
/// a weight's gradient must be applied at its own apply order, not
/// somewhere inside a coarse "backward" slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionOrder {
    pub forward: usize,
    pub calc_gradient: usize,
    pub calc_derivative: usize,
    pub apply_gradient: usize,
}

impl ExecutionOrder {
    /// The node's position in the backward total order (its first
    /// backward event).
    pub fn backward(&self) -> usize {
        self.calc_gradient
    }
}

/// One layer instance in the computation graph.
#[derive(Clone)]
pub struct LayerNode {
    name: String,
    layer: Box<dyn Layer>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    fused_activation: ActivationType,
    trainable: bool,
    needs_backwarding: bool,
    exec_order: ExecutionOrder,
    run_context: Option<RunContext>,
}

impl LayerNode {
    pub fn new(name: impl Into<String>, layer: Box<dyn Layer>) -> Self {
        LayerNode {
            name: name.into(),
            layer,
            input_names: Vec::new(),
            output_names: Vec::new(),
            fused_activation: ActivationType::None,
            trainable: true,
            needs_backwarding: false,
            exec_order: ExecutionOrder::default(),
            run_context: None,
        }
    }

    /// Declare explicit input connections by predecessor name.
    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.input_names = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declare a fused activation; compile splits it into a trailing
    /// activation node.
    pub fn with_activation(mut self, act: ActivationType) -> Self {
        self.fused_activation = act;
        self
    }

    /// Mark the node frozen (weights excluded from training).
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.layer.kind()
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }

    pub fn input_connections(&self) -> &[String] {
        &self.input_names
    }

    pub fn set_input_connections(&mut self, inputs: Vec<String>) {
        self.input_names = inputs;
    }

    /// Rewrite one input connection (consumer rewiring during
    /// activation realization and subgraph splicing).
    pub fn rename_input(&mut self, from: &str, to: &str) {
        for name in &mut self.input_names {
            if name == from {
                *name = to.to_string();
            }
        }
    }

    /// Derived consumers of this node's output.
    pub fn output_connections(&self) -> &[String] {
        &self.output_names
    }

    pub fn set_output_connections(&mut self, outputs: Vec<String>) {
        self.output_names = outputs;
    }

    pub fn fused_activation(&self) -> ActivationType {
        self.fused_activation
    }

    /// Clear the fused activation once it has been realized as its own
    /// node.
    pub fn take_fused_activation(&mut self) -> ActivationType {
        std::mem::replace(&mut self.fused_activation, ActivationType::None)
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    pub fn needs_backwarding(&self) -> bool {
        self.needs_backwarding
    }

    pub fn set_needs_backwarding(&mut self, needs: bool) {
        self.needs_backwarding = needs;
    }

    pub fn exec_order(&self) -> ExecutionOrder {
        self.exec_order
    }

    pub fn set_exec_order(&mut self, order: ExecutionOrder) {
        self.exec_order = order;
    }

    pub fn supports_backwarding(&self) -> bool {
        self.layer.supports_backwarding()
    }

    pub fn requires_label(&self) -> bool {
        self.layer.requires_label()
    }

    /// In-place eligibility of this node.
    ///
    /// Fan-out makes a node ineligible regardless of the layer's own
    /// capability: after this node executed, its input buffer may still
    /// be read by the other consumers of the producing node.
    pub fn can_execute_in_place(&self) -> InPlaceType {
        if self.output_names.len() > 1 {
            return InPlaceType::None;
        }
        self.layer.support_in_place()
    }

    pub fn run_context(&self) -> Result<&RunContext> {
        self.run_context
            .as_ref()
            .ok_or_else(|| Error::msg(format!("node '{}' is not initialized", self.name)))
    }

    pub fn set_run_context(&mut self, ctx: RunContext) {
        self.run_context = Some(ctx);
    }

    pub fn is_initialized(&self) -> bool {
        self.run_context.is_some()
    }

    // ── Execution entry points driven by the engine ──

    pub fn finalize(&mut self, ctx: &mut InitContext) -> Result<()> {
        self.layer.finalize(ctx)
    }

    pub fn forwarding(&mut self, training: bool) -> Result<()> {
        let ctx = self
            .run_context
            .as_ref()
            .ok_or_else(|| Error::msg(format!("node '{}' is not initialized", self.name)))?;
        self.layer.forward(ctx, training)
    }

    pub fn calc_derivative(&mut self) -> Result<()> {
        let ctx = self
            .run_context
            .as_ref()
            .ok_or_else(|| Error::msg(format!("node '{}' is not initialized", self.name)))?;
        self.layer.calc_derivative(ctx)
    }

    pub fn calc_gradient(&mut self) -> Result<()> {
        let ctx = self
            .run_context
            .as_ref()
            .ok_or_else(|| Error::msg(format!("node '{}' is not initialized", self.name)))?;
        self.layer.calc_gradient(ctx)
    }

    pub fn set_batch(&mut self, batch: usize) {
        self.layer.set_batch(batch);
    }
}

impl GraphNode for LayerNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }
}
