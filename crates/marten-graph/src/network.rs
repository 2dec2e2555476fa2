// NetworkGraph — compile, plan, and drive a training graph
//
// The engine owns the node container and the tensor pool and moves the
// model through four phases:
//
//   Uninitialized --compile--> Compiled --initialize--> Initialized
//       --allocate_tensors--> Allocated
//
// compile realizes connections (implicit previous-node inputs, fused
// activations, the terminal loss), sorts the nodes, marks the backward
// set, and assigns execution orders. initialize runs shape inference,
// registers every tensor with its access interval, and wires the run
// contexts. allocate_tensors hands the intervals to the planner and
// materializes storage. A failed compile commits nothing: all
// realization happens on a copy that replaces the graph only on
// success.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info};

use marten_core::{ComputeContext, DType, Error, Result, Tensor, TensorDim};

use crate::context::{InitContext, RunContext};
use crate::graph::{Graph, GraphNode, NodeRef};
use crate::layer::InPlaceType;
use crate::layers::activation::ActivationLayer;
use crate::layers::loss::LossType;
use crate::node::{ExecutionOrder, LayerNode};
use crate::pool::{ExecMode, TensorId, TensorKind, TensorLifespan, TensorPool};

/// Lifecycle phase of a [`NetworkGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphPhase {
    Uninitialized,
    Compiled,
    Initialized,
    Allocated,
}

/// The training-graph engine.
pub struct NetworkGraph {
    ctx: ComputeContext,
    graph: Graph<LayerNode>,
    pool: Rc<RefCell<TensorPool>>,
    phase: GraphPhase,
    exec_mode: ExecMode,
    tensor_dtype: DType,
    batch_size: usize,
    optimize_memory: bool,
    input_nodes: Vec<String>,
    output_nodes: Vec<String>,
    label_nodes: Vec<String>,
    /// Gradient and derivative buffers zeroed at each backward start.
    reset_ids: Vec<TensorId>,
}

impl NetworkGraph {
    pub fn new(ctx: ComputeContext) -> Self {
        NetworkGraph {
            ctx,
            graph: Graph::new(),
            pool: Rc::new(RefCell::new(TensorPool::new())),
            phase: GraphPhase::Uninitialized,
            exec_mode: ExecMode::Train,
            tensor_dtype: DType::F32,
            batch_size: 1,
            optimize_memory: true,
            input_nodes: Vec::new(),
            output_nodes: Vec::new(),
            label_nodes: Vec::new(),
            reset_ids: Vec::new(),
        }
    }

    pub fn phase(&self) -> GraphPhase {
        self.phase
    }

    pub fn device(&self) -> marten_core::Device {
        self.ctx.device()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Element format used for activations, derivatives, and scratch
    /// tensors. Weights always stay in full precision.
    pub fn set_tensor_format(&mut self, dtype: DType) -> Result<()> {
        if self.phase >= GraphPhase::Initialized {
            return Err(Error::msg("tensor format is fixed once initialized"));
        }
        self.tensor_dtype = dtype;
        Ok(())
    }

    /// Toggle memory packing and in-place execution together. Must be
    /// set before initialize.
    pub fn set_memory_optimizations(&mut self, enabled: bool) -> Result<()> {
        if self.phase >= GraphPhase::Initialized {
            return Err(Error::msg(
                "memory optimizations are fixed once initialized",
            ));
        }
        self.optimize_memory = enabled;
        self.pool.borrow_mut().set_optimizations(enabled);
        Ok(())
    }

    fn require_phase(&self, phase: GraphPhase, what: &str) -> Result<()> {
        if self.phase != phase {
            return Err(Error::msg(format!(
                "{} requires the {:?} phase, but the graph is {:?}",
                what, phase, self.phase
            )));
        }
        Ok(())
    }

    // ── Construction ──

    /// Append a node in declaration order. Only legal before compile.
    pub fn add_layer(&mut self, node: LayerNode) -> Result<()> {
        self.require_phase(GraphPhase::Uninitialized, "add_layer")?;
        self.graph.add_node(node)?;
        Ok(())
    }

    /// Splice another model's nodes under a name prefix.
    ///
    /// Every spliced name becomes `{prefix}/{name}`; connections among
    /// the spliced nodes are rewritten to match, connections naming
    /// outside nodes are kept, and a spliced node with no inputs is
    /// connected to the current last declared node.
    pub fn extend_graph(&mut self, nodes: Vec<LayerNode>, prefix: &str) -> Result<()> {
        self.require_phase(GraphPhase::Uninitialized, "extend_graph")?;
        let spliced: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        // Check the whole batch up front so a collision commits nothing.
        for name in &spliced {
            let new_name = format!("{}/{}", prefix, name);
            if self.graph.contains(&new_name) {
                return Err(Error::DuplicateName(new_name));
            }
        }
        let tail = if self.graph.is_empty() {
            None
        } else {
            Some(
                self.graph
                    .node_at(self.graph.size() - 1)?
                    .borrow()
                    .name()
                    .to_string(),
            )
        };

        for mut node in nodes {
            let new_name = format!("{}/{}", prefix, node.name());
            node.set_name(new_name);
            let inputs: Vec<String> = node
                .input_connections()
                .iter()
                .map(|input| {
                    if spliced.iter().any(|s| s == input) {
                        format!("{}/{}", prefix, input)
                    } else {
                        input.clone()
                    }
                })
                .collect();
            if inputs.is_empty() && node.kind() != "input" {
                if let Some(tail) = &tail {
                    node.set_input_connections(vec![tail.clone()]);
                }
            } else {
                node.set_input_connections(inputs);
            }
            self.graph.add_node(node)?;
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<NodeRef<LayerNode>> {
        self.graph.node(name)
    }

    /// Node handles in declaration order, regardless of compile state.
    pub fn get_unsorted_layers(&self) -> Vec<NodeRef<LayerNode>> {
        self.graph.iter().cloned().collect()
    }

    /// Declaration-order slice of nodes between two names, inclusive.
    pub fn get_unsorted_layers_between(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<NodeRef<LayerNode>>> {
        let all = self.get_unsorted_layers();
        let pos = |name: &str| {
            all.iter()
                .position(|n| n.borrow().name() == name)
                .ok_or_else(|| Error::NotFound(format!("node '{}'", name)))
        };
        let (start, end) = (pos(from)?, pos(to)?);
        if start > end {
            return Err(Error::InvalidArgument(format!(
                "'{}' is declared after '{}'",
                from, to
            )));
        }
        Ok(all[start..=end].to_vec())
    }

    /// Node names in execution order. Empty before compile.
    pub fn sorted_names(&self) -> Vec<String> {
        self.graph
            .sorted_iter()
            .map(|n| n.borrow().name().to_string())
            .collect()
    }

    // ── Compile ──

    /// Realize the declared nodes into an executable graph.
    ///
    /// Works on a copy and commits only on success, so a failed compile
    /// leaves the graph exactly as declared.
    pub fn compile(&mut self, loss: Option<LossType>) -> Result<()> {
        self.require_phase(GraphPhase::Uninitialized, "compile")?;
        if self.graph.is_empty() {
            return Err(Error::msg("cannot compile an empty graph"));
        }

        let mut g = self.graph.try_clone()?;

        Self::realize_default_inputs(&g)?;
        Self::realize_activations(&mut g)?;
        if let Some(loss) = loss {
            Self::realize_loss(&mut g, loss)?;
        }
        Self::derive_output_connections(&g);

        g.topological_sort()?;
        Self::mark_nodes_for_backwarding(&g);
        Self::assign_execution_orders(&g);
        Self::check_compiled(&g)?;

        let input_nodes: Vec<String> = g
            .iter()
            .filter(|n| n.borrow().input_connections().is_empty())
            .map(|n| n.borrow().name().to_string())
            .collect();
        let output_nodes: Vec<String> = g
            .iter()
            .filter(|n| n.borrow().output_connections().is_empty())
            .map(|n| n.borrow().name().to_string())
            .collect();
        let label_nodes: Vec<String> = g
            .iter()
            .filter(|n| n.borrow().requires_label())
            .map(|n| n.borrow().name().to_string())
            .collect();

        info!(
            "graph compiled: {} nodes, {} inputs, {} outputs",
            g.size(),
            input_nodes.len(),
            output_nodes.len()
        );

        self.graph = g;
        self.input_nodes = input_nodes;
        self.output_nodes = output_nodes;
        self.label_nodes = label_nodes;
        self.phase = GraphPhase::Compiled;
        Ok(())
    }

    /// A node declared without inputs consumes the previously declared
    /// node. Source kinds and the first node are left alone.
    fn realize_default_inputs(g: &Graph<LayerNode>) -> Result<()> {
        for i in 1..g.size() {
            let node = g.node_at(i)?;
            if !node.borrow().input_connections().is_empty() || node.borrow().kind() == "input" {
                continue;
            }
            let prev = g.node_at(i - 1)?.borrow().name().to_string();
            node.borrow_mut().set_input_connections(vec![prev]);
        }
        Ok(())
    }

    /// Split each fused activation into a trailing activation node and
    /// rewire the consumers of the host node onto it.
    fn realize_activations(g: &mut Graph<LayerNode>) -> Result<()> {
        let hosts: Vec<String> = g
            .iter()
            .filter(|n| n.borrow().fused_activation() != crate::layers::ActivationType::None)
            .map(|n| n.borrow().name().to_string())
            .collect();

        for host in hosts {
            let act = g.node(&host)?.borrow_mut().take_fused_activation();
            let act_name = format!("{}/activation", host);
            for node in g.iter() {
                node.borrow_mut().rename_input(&host, &act_name);
            }
            let act_node = LayerNode::new(act_name, Box::new(ActivationLayer::new(act)))
                .with_inputs(&[host.as_str()]);
            g.add_node(act_node)?;
        }
        Ok(())
    }

    /// Append the requested loss behind every terminal node. A single
    /// terminal keeps the plain "loss" name; multiple heads each get a
    /// numbered loss, in declaration order.
    fn realize_loss(g: &mut Graph<LayerNode>, loss: LossType) -> Result<()> {
        let consumed: Vec<String> = g
            .iter()
            .flat_map(|n| n.borrow().input_connections().to_vec())
            .collect();
        let terminals: Vec<String> = g
            .iter()
            .filter(|n| !consumed.iter().any(|c| c == n.borrow().name()))
            .map(|n| n.borrow().name().to_string())
            .collect();

        for terminal in &terminals {
            if g.node(terminal)?.borrow().requires_label() {
                return Err(Error::InvalidParameter {
                    node: terminal.clone(),
                    reason: "graph already terminates in a loss node".to_string(),
                });
            }
        }
        for (i, terminal) in terminals.iter().enumerate() {
            let name = if terminals.len() == 1 {
                "loss".to_string()
            } else {
                format!("loss{}", i)
            };
            let loss_node =
                LayerNode::new(name, loss.build()).with_inputs(&[terminal.as_str()]);
            g.add_node(loss_node)?;
        }
        Ok(())
    }

    /// Record each node's consumers, in declaration order, one entry
    /// per connection. A node listed twice by one consumer appears
    /// twice.
    fn derive_output_connections(g: &Graph<LayerNode>) {
        let edges: Vec<(String, Vec<String>)> = g
            .iter()
            .map(|n| {
                let n = n.borrow();
                (n.name().to_string(), n.input_connections().to_vec())
            })
            .collect();

        for node in g.iter() {
            let name = node.borrow().name().to_string();
            let consumers: Vec<String> = edges
                .iter()
                .flat_map(|(consumer, inputs)| {
                    inputs
                        .iter()
                        .filter(|input| **input == name)
                        .map(move |_| consumer.clone())
                })
                .collect();
            node.borrow_mut().set_output_connections(consumers);
        }
    }

    /// A node joins the backward set when it is trainable or any of its
    /// producers is in the set. Nodes that cannot backward never join;
    /// a frozen prefix of the graph is skipped entirely.
    fn mark_nodes_for_backwarding(g: &Graph<LayerNode>) {
        for node in g.sorted_iter() {
            let needs = {
                let n = node.borrow();
                n.supports_backwarding()
                    && (n.is_trainable()
                        || n.input_connections().iter().any(|input| {
                            g.node(input)
                                .map(|p| p.borrow().needs_backwarding())
                                .unwrap_or(false)
                        }))
            };
            node.borrow_mut().set_needs_backwarding(needs);
        }
    }

    /// Forward order is the topological index. Backward events are laid
    /// out after all forward events, walking the sorted order in
    /// reverse: the k-th backward node gets three consecutive slots for
    /// calc_gradient, calc_derivative, and apply_gradient.
    fn assign_execution_orders(g: &Graph<LayerNode>) {
        let n = g.size();
        for (i, node) in g.sorted_iter().enumerate() {
            node.borrow_mut().set_exec_order(ExecutionOrder {
                forward: i,
                calc_gradient: i,
                calc_derivative: i,
                apply_gradient: i,
            });
        }
        let mut k = 0;
        for node in g.reverse_sorted_iter() {
            if !node.borrow().needs_backwarding() {
                continue;
            }
            let base = n + 3 * k;
            let forward = node.borrow().exec_order().forward;
            node.borrow_mut().set_exec_order(ExecutionOrder {
                forward,
                calc_gradient: base,
                calc_derivative: base + 1,
                apply_gradient: base + 2,
            });
            k += 1;
        }
    }

    fn check_compiled(g: &Graph<LayerNode>) -> Result<()> {
        for node in g.iter() {
            let n = node.borrow();
            if n.requires_label() && !n.output_connections().is_empty() {
                return Err(Error::InvalidParameter {
                    node: n.name().to_string(),
                    reason: "loss nodes must be terminal".to_string(),
                });
            }
        }
        Ok(())
    }

    // ── Initialize ──

    /// Run shape inference over the sorted order, register every tensor
    /// with the pool, and wire each node's run context.
    ///
    /// `inputs` and `labels` name the feed points; empty slices
    /// auto-detect them (source nodes, label-consuming nodes).
    pub fn initialize(&mut self, inputs: &[&str], labels: &[&str]) -> Result<()> {
        self.require_phase(GraphPhase::Compiled, "initialize")?;

        if !inputs.is_empty() {
            for name in inputs {
                let node = self.graph.node(name)?;
                if !node.borrow().input_connections().is_empty() {
                    return Err(Error::InvalidParameter {
                        node: name.to_string(),
                        reason: "declared as input but has producers".to_string(),
                    });
                }
            }
            self.input_nodes = inputs.iter().map(|s| s.to_string()).collect();
        }
        if !labels.is_empty() {
            for name in labels {
                let node = self.graph.node(name)?;
                if !node.borrow().requires_label() {
                    return Err(Error::InvalidParameter {
                        node: name.to_string(),
                        reason: "declared as label target but consumes no label".to_string(),
                    });
                }
            }
            self.label_nodes = labels.iter().map(|s| s.to_string()).collect();
        }

        for i in 0..self.graph.size() {
            let node_ref = self.graph.sorted_node_at(i)?;
            self.initialize_node(&node_ref)?;
        }

        if self.optimize_memory {
            self.in_place_optimize()?;
        }

        // Model batch size follows the first input.
        if let Some(name) = self.input_nodes.first() {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            let rc = node.run_context()?;
            if rc.num_outputs() > 0 {
                self.batch_size = self.pool.borrow().dim(rc.outputs[0])?.batch();
            }
        }

        self.phase = GraphPhase::Initialized;
        debug!(
            "graph initialized: {} tensors registered",
            self.pool.borrow().len()
        );
        Ok(())
    }

    /// Shape inference and tensor registration for one node.
    fn initialize_node(&mut self, node_ref: &NodeRef<LayerNode>) -> Result<()> {
        let (name, order, needs, requires_label, is_input, trainable) = {
            let n = node_ref.borrow();
            (
                n.name().to_string(),
                n.exec_order(),
                n.needs_backwarding(),
                n.requires_label(),
                n.kind() == "input",
                n.is_trainable(),
            )
        };

        // Resolve this node's input tensors from its producers.
        let input_conns: Vec<String> = node_ref.borrow().input_connections().to_vec();
        let mut inputs = Vec::new();
        let mut input_grads = Vec::new();
        let mut input_dims = Vec::new();
        let mut occurrence: Vec<(String, usize)> = Vec::new();
        for input in &input_conns {
            let count = match occurrence.iter_mut().find(|(n, _)| n == input) {
                Some((_, c)) => {
                    *c += 1;
                    *c - 1
                }
                None => {
                    occurrence.push((input.clone(), 1));
                    0
                }
            };
            let producer = self.graph.node(input)?;
            let p = producer.borrow();
            let prc = p.run_context()?;
            let idx = Self::output_index(&p, &name, count, prc.num_outputs())?;
            let out_id = prc.output_ids()[idx];
            let grad_id = prc.output_grads[idx];

            let mut orders = vec![order.forward];
            if needs {
                orders.push(order.calc_gradient);
                orders.push(order.calc_derivative);
            }
            let mut pool = self.pool.borrow_mut();
            pool.extend(out_id, &orders)?;
            if needs {
                pool.extend(grad_id, &[order.calc_derivative])?;
            }
            input_dims.push(pool.dim(out_id)?.clone());
            inputs.push(out_id);
            input_grads.push(grad_id);
        }

        // Shape inference.
        let mut ictx = InitContext::new(name.clone(), input_dims);
        node_ref.borrow_mut().finalize(&mut ictx)?;
        if ictx.output_dims().is_empty() {
            return Err(Error::InvalidParameter {
                node: name,
                reason: "layer declared no output shapes".to_string(),
            });
        }

        let mut rc = RunContext::new(Rc::clone(&self.pool));
        rc.inputs = inputs;
        rc.input_grads = input_grads;

        let mut pool = self.pool.borrow_mut();

        // Output activations and their derivative buffers.
        for (i, dim) in ictx.output_dims().iter().enumerate() {
            let kind = if is_input {
                TensorKind::Input
            } else {
                TensorKind::Activation
            };
            let mut orders = vec![order.forward];
            if needs {
                orders.push(order.calc_derivative);
            }
            let out = pool.request(
                format!("{}:out{}", name, i),
                dim.clone(),
                self.tensor_dtype,
                kind,
                TensorLifespan::Backward,
                marten_core::Initializer::None,
                false,
                &orders,
            )?;
            rc.outputs.push(out);

            let grad_orders = if needs {
                vec![order.calc_gradient, order.calc_derivative]
            } else {
                Vec::new()
            };
            let grad = pool.request(
                format!("{}:out{}:grad", name, i),
                dim.clone(),
                self.tensor_dtype,
                TensorKind::Derivative,
                TensorLifespan::Backward,
                marten_core::Initializer::Zeros,
                false,
                &grad_orders,
            )?;
            rc.output_grads.push(grad);
            self.reset_ids.push(grad);
        }

        // Weights and their gradients.
        for req in ictx.weight_requests() {
            let eff_trainable = req.trainable && trainable;
            let mut orders = vec![order.forward];
            if needs {
                orders.push(order.calc_gradient);
                orders.push(order.apply_gradient);
            }
            let w = pool.request_weight(
                req.name.clone(),
                req.dim.clone(),
                DType::F32,
                req.init,
                eff_trainable,
                &orders,
            )?;
            rc.weights.push(w);
            if needs && trainable {
                let g =
                    pool.request_gradient(w, &[order.calc_gradient, order.apply_gradient])?;
                rc.weight_grads.push(g);
                self.reset_ids.push(g);
            }
        }

        // Layer-private scratch tensors.
        for req in ictx.tensor_requests() {
            let orders = match req.lifespan {
                TensorLifespan::ForwardFunc => vec![order.forward],
                _ => vec![order.forward, order.calc_gradient, order.calc_derivative],
            };
            let t = pool.request(
                req.name.clone(),
                req.dim.clone(),
                self.tensor_dtype,
                TensorKind::Scratch,
                req.lifespan,
                req.init,
                false,
                &orders,
            )?;
            rc.tensors.push(t);
        }

        // Loss nodes consume a label shaped like their prediction.
        if requires_label {
            let dim = pool.dim(rc.inputs[0])?.clone();
            let label = pool.request(
                format!("{}:label", name),
                dim,
                self.tensor_dtype,
                TensorKind::Label,
                TensorLifespan::Iteration,
                marten_core::Initializer::Zeros,
                false,
                &[order.forward, order.calc_derivative],
            )?;
            rc.label = Some(label);
        }

        drop(pool);
        node_ref.borrow_mut().set_run_context(rc);
        Ok(())
    }

    /// Map one consumer connection to the producer's output index.
    /// Single-output producers fan out from output 0; multi-output
    /// producers hand each connection its own slot.
    fn output_index(
        producer: &LayerNode,
        consumer: &str,
        occurrence: usize,
        num_outputs: usize,
    ) -> Result<usize> {
        if num_outputs <= 1 {
            return Ok(0);
        }
        let mut seen = 0;
        for (pos, name) in producer.output_connections().iter().enumerate() {
            if name == consumer {
                if seen == occurrence {
                    if pos >= num_outputs {
                        return Err(Error::InvalidParameter {
                            node: producer.name().to_string(),
                            reason: format!(
                                "{} consumer connections but only {} outputs",
                                producer.output_connections().len(),
                                num_outputs
                            ),
                        });
                    }
                    return Ok(pos);
                }
                seen += 1;
            }
        }
        Err(Error::InvalidParameter {
            node: producer.name().to_string(),
            reason: format!("no output slot for consumer '{}'", consumer),
        })
    }

    /// Alias eligible nodes' outputs onto their inputs, and for pure
    /// pass-throughs alias the derivative pair as well.
    ///
    /// Eligibility: a single-input single-output node whose layer
    /// advertises in-place support, with no fan-out on either side of
    /// the edge.
    fn in_place_optimize(&mut self) -> Result<()> {
        for node_ref in self.graph.sorted() {
            let node = node_ref.borrow();
            let in_place = node.can_execute_in_place();
            if in_place == InPlaceType::None {
                continue;
            }
            let rc = match node.run_context() {
                Ok(rc) => rc,
                Err(_) => continue,
            };
            if rc.num_inputs() != 1 || rc.num_outputs() != 1 {
                continue;
            }
            let producer_name = node.input_connections()[0].clone();
            let producer = self.graph.node(&producer_name)?;
            if producer.borrow().output_connections().len() != 1 {
                continue;
            }

            let mut pool = self.pool.borrow_mut();
            pool.make_dependent(rc.outputs[0], rc.inputs[0])?;
            if in_place == InPlaceType::NonRestricted {
                pool.make_dependent(rc.input_grads[0], rc.output_grads[0])?;
            }
            debug!(
                "in-place: '{}' output shares '{}' storage ({:?})",
                node.name(),
                producer_name,
                in_place
            );
        }
        Ok(())
    }

    // ── Allocation ──

    /// Plan and materialize storage for the given execution mode.
    /// Inference skips gradient, derivative, and optimizer tensors.
    pub fn allocate_tensors(&mut self, mode: ExecMode) -> Result<()> {
        self.require_phase(GraphPhase::Initialized, "allocate_tensors")?;
        self.pool.borrow_mut().allocate(mode)?;
        self.exec_mode = mode;
        self.phase = GraphPhase::Allocated;
        Ok(())
    }

    /// Release storage. Weights and optimizer state survive unless
    /// `dealloc_weights` is set.
    pub fn deallocate_tensors(&mut self, dealloc_weights: bool) {
        self.pool.borrow_mut().deallocate(dealloc_weights);
        if self.phase == GraphPhase::Allocated {
            self.phase = GraphPhase::Initialized;
        }
    }

    /// Register optimizer-state tensors for every trainable weight.
    /// `shapes` maps a weight's shape to the per-weight state shapes
    /// (e.g. two moments for Adam). Must run before allocation.
    pub fn request_optimizer_variables<F>(
        &mut self,
        shapes: F,
    ) -> Result<Vec<(TensorId, Vec<TensorId>)>>
    where
        F: Fn(&TensorDim) -> Vec<TensorDim>,
    {
        self.require_phase(GraphPhase::Initialized, "request_optimizer_variables")?;
        let mut pool = self.pool.borrow_mut();
        let weights = pool.weights();
        let mut out = Vec::new();
        for w in weights {
            if !pool.is_trainable(w)? {
                continue;
            }
            let dims = shapes(pool.dim(w)?);
            let ids = pool.request_optimizer_variables(w, dims)?;
            out.push((w, ids));
        }
        Ok(out)
    }

    // ── Execution ──

    /// Run the forward pass and return the terminal output tensors.
    pub fn forwarding(&mut self, training: bool) -> Result<Vec<Tensor>> {
        self.require_phase(GraphPhase::Allocated, "forwarding")?;
        for node in self.graph.sorted() {
            node.borrow_mut().forwarding(training)?;
        }
        self.output_tensors()
    }

    /// Run the backward pass.
    ///
    /// Each derivative and gradient buffer is zeroed at its first
    /// backward access, right before the node that writes it runs, so
    /// the zero-fill stays inside the interval the planner packed the
    /// buffer by. Backward implementations accumulate into the zeroed
    /// buffers, which makes fan-out sum correctly. `apply_op` is called
    /// once per trainable weight, at the gradient's last access, with
    /// (weight, gradient, iteration).
    pub fn backwarding<F>(&mut self, iteration: usize, mut apply_op: F) -> Result<()>
    where
        F: FnMut(&Tensor, &Tensor, usize) -> Result<()>,
    {
        self.require_phase(GraphPhase::Allocated, "backwarding")?;
        if self.exec_mode != ExecMode::Train {
            return Err(Error::msg(
                "backwarding requires tensors allocated for training",
            ));
        }

        // Aliases share their root's storage; resetting the root once
        // covers them.
        let mut resets: BTreeMap<usize, Vec<TensorId>> = BTreeMap::new();
        {
            let pool = self.pool.borrow();
            for &id in &self.reset_ids {
                if pool.is_dependent(id)? {
                    continue;
                }
                if let Some(first) = pool.first_access(id)? {
                    resets.entry(first).or_default().push(id);
                }
            }
        }

        for node_ref in self.graph.reverse_sorted_iter() {
            let (needs, trainable, order) = {
                let n = node_ref.borrow();
                (n.needs_backwarding(), n.is_trainable(), n.exec_order())
            };
            if !needs {
                continue;
            }
            self.zero_buffers(&mut resets, order.calc_gradient)?;
            if trainable {
                node_ref.borrow_mut().calc_gradient()?;
            }
            self.zero_buffers(&mut resets, order.calc_derivative)?;
            node_ref.borrow_mut().calc_derivative()?;

            // Apply each weight's gradient exactly once, at its final
            // accumulation point.
            let node = node_ref.borrow();
            let rc = node.run_context()?;
            let pool = self.pool.borrow();
            for (w, g) in rc.weight_ids().iter().zip(rc.weight_grads.iter()) {
                if !pool.is_trainable(*w)? {
                    continue;
                }
                if pool.last_access(*g)? == Some(order.apply_gradient) {
                    let weight = pool.tensor(*w)?;
                    let grad = pool.tensor(*g)?;
                    apply_op(&weight, &grad, iteration)?;
                }
            }
        }
        Ok(())
    }

    /// Zero the buffers whose first backward access is `order`.
    fn zero_buffers(
        &self,
        resets: &mut BTreeMap<usize, Vec<TensorId>>,
        order: usize,
    ) -> Result<()> {
        if let Some(ids) = resets.remove(&order) {
            let pool = self.pool.borrow();
            for id in ids {
                pool.tensor(id)?.fill(0.0);
            }
        }
        Ok(())
    }

    // ── Feeding and inspection ──

    /// Write one batch per input node, in input declaration order.
    pub fn set_inputs(&mut self, data: &[&[f32]]) -> Result<()> {
        self.require_phase(GraphPhase::Allocated, "set_inputs")?;
        if data.len() != self.input_nodes.len() {
            return Err(Error::msg(format!(
                "expected {} input batches, got {}",
                self.input_nodes.len(),
                data.len()
            )));
        }
        for (name, batch) in self.input_nodes.iter().zip(data) {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            node.run_context()?.output(0)?.set_data(batch)?;
        }
        Ok(())
    }

    /// Write one label batch per label-consuming node.
    pub fn set_labels(&mut self, data: &[&[f32]]) -> Result<()> {
        self.require_phase(GraphPhase::Allocated, "set_labels")?;
        if data.len() != self.label_nodes.len() {
            return Err(Error::msg(format!(
                "expected {} label batches, got {}",
                self.label_nodes.len(),
                data.len()
            )));
        }
        for (name, batch) in self.label_nodes.iter().zip(data) {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            node.run_context()?.label()?.set_data(batch)?;
        }
        Ok(())
    }

    /// Current loss: the batch mean of each loss node's per-sample
    /// output, summed over loss nodes. Valid after a forward pass.
    pub fn loss(&self) -> Result<f32> {
        self.require_phase(GraphPhase::Allocated, "loss")?;
        let mut total = 0.0;
        for name in &self.label_nodes {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            let out = node.run_context()?.output(0)?;
            let values = out.read();
            if !values.is_empty() {
                total += values.iter().sum::<f32>() / values.len() as f32;
            }
        }
        Ok(total)
    }

    pub fn input_dimensions(&self) -> Result<Vec<TensorDim>> {
        self.dims_of(&self.input_nodes)
    }

    pub fn output_dimensions(&self) -> Result<Vec<TensorDim>> {
        self.dims_of(&self.output_nodes)
    }

    fn dims_of(&self, names: &[String]) -> Result<Vec<TensorDim>> {
        if self.phase < GraphPhase::Initialized {
            return Err(Error::msg("dimensions are known once initialized"));
        }
        let pool = self.pool.borrow();
        let mut dims = Vec::new();
        for name in names {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            let rc = node.run_context()?;
            dims.push(pool.dim(rc.outputs[0])?.clone());
        }
        Ok(dims)
    }

    /// Terminal output tensors, in declaration order.
    pub fn output_tensors(&self) -> Result<Vec<Tensor>> {
        self.require_phase(GraphPhase::Allocated, "output_tensors")?;
        let mut out = Vec::new();
        for name in &self.output_nodes {
            let node = self.graph.node(name)?;
            let node = node.borrow();
            out.push(node.run_context()?.output(0)?);
        }
        Ok(out)
    }

    /// Change the batch size. Weight values survive; activation-class
    /// tensors are invalidated and the graph drops back to Initialized
    /// until tensors are allocated again.
    pub fn set_batch_size(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::InvalidArgument("batch size must be > 0".into()));
        }
        if batch == self.batch_size {
            return Ok(());
        }
        for node in self.graph.iter() {
            node.borrow_mut().set_batch(batch);
        }
        if self.phase >= GraphPhase::Initialized {
            self.pool.borrow_mut().set_batch_size(batch);
            if self.phase == GraphPhase::Allocated {
                self.phase = GraphPhase::Initialized;
            }
        }
        self.batch_size = batch;
        debug!("batch size set to {}", batch);
        Ok(())
    }
}
