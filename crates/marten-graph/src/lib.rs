//! # marten-graph
//!
//! Training-time graph engine: compiles a declared set of layer nodes
//! into an executable DAG, schedules forward and backward passes, and
//! plans tensor storage so that non-overlapping lifetimes share memory.
//!
//! The lifecycle is explicit:
//!
//! ```text
//! add_layer* -> compile -> initialize -> allocate_tensors
//!            -> { set_inputs / set_labels / forwarding / backwarding }*
//! ```
//!
//! [`NetworkGraph`] drives the whole pipeline; [`TensorPool`] owns every
//! managed tensor and its access interval; the planners in [`planner`]
//! turn intervals into packed storage regions.

pub mod context;
pub mod graph;
pub mod layer;
pub mod layers;
pub mod network;
pub mod node;
pub mod planner;
pub mod pool;

pub use context::{InitContext, RunContext};
pub use graph::{Graph, GraphNode, NodeRef};
pub use layer::{InPlaceType, Layer};
pub use layers::{
    ActivationLayer, ActivationType, CrossEntropyLossLayer, FullyConnectedLayer, IdentityLayer,
    InputLayer, LossType, MseLossLayer, MultiOutLayer,
};
pub use network::{GraphPhase, NetworkGraph};
pub use node::{ExecutionOrder, LayerNode};
pub use planner::{IntervalPlanner, MemoryPlan, MemoryPlanner, NoReusePlanner, PlanRequest};
pub use pool::{ExecMode, TensorId, TensorKind, TensorLifespan, TensorPool};
