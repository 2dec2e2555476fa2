// TensorPool — lifetime manager for every tensor the graph needs
//
// The pool is an arena: every managed tensor (weight, weight gradient,
// optimizer variable, activation, derivative, scratch, input, label)
// is one entry, addressed by a stable TensorId. Nodes hold ids, never
// tensors, so cross-references between nodes and tensors can never form
// ownership cycles.
//
// Aliasing is a parent pointer: a dependent entry names its source and
// resolves to the source's storage at allocation time. The planner only
// ever sees root entries, with intervals widened to cover their
// aliases' accesses.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use marten_core::{DType, Error, Initializer, Result, Tensor, TensorDim};

use crate::planner::{IntervalPlanner, MemoryPlan, MemoryPlanner, NoReusePlanner, PlanRequest};

/// Stable handle to a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// How long a managed tensor's storage must remain valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLifespan {
    /// Storage is managed externally; the pool never allocates it.
    Unmanaged,
    /// Alive only across the forward accesses of one iteration.
    ForwardFunc,
    /// Written in forward, consumed during the backward pass.
    Backward,
    /// Alive for the whole of each iteration.
    Iteration,
    /// Model lifetime; released only at teardown or an explicit
    /// weight deallocation.
    Max,
}

/// What role a managed tensor plays. The kind drives batch-rewrite and
/// deallocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Weight,
    WeightGradient,
    OptimizerVariable,
    Activation,
    Derivative,
    Scratch,
    Input,
    Label,
}

impl TensorKind {
    /// Whether the batch axis of this tensor follows the model batch size.
    pub fn is_batch_dependent(self) -> bool {
        matches!(
            self,
            TensorKind::Activation
                | TensorKind::Derivative
                | TensorKind::Scratch
                | TensorKind::Input
                | TensorKind::Label
        )
    }

    /// Whether this tensor survives `deallocate(false)`.
    pub fn is_persistent(self) -> bool {
        matches!(self, TensorKind::Weight | TensorKind::OptimizerVariable)
    }

    /// Whether this tensor only exists for gradient computation and can
    /// be skipped entirely in inference mode.
    pub fn is_train_only(self) -> bool {
        matches!(
            self,
            TensorKind::WeightGradient | TensorKind::Derivative | TensorKind::OptimizerVariable
        )
    }
}

/// Execution mode the pool is allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Train,
    Inference,
}

struct PoolEntry {
    name: String,
    dim: TensorDim,
    dtype: DType,
    kind: TensorKind,
    lifespan: TensorLifespan,
    init: Initializer,
    trainable: bool,
    /// Every execution order at which this tensor is read or written.
    exec_orders: Vec<usize>,
    /// Alias parent; storage resolves through the chain to a root.
    source: Option<TensorId>,
    /// Materialized view; None until allocated (or after deallocation).
    tensor: Option<Tensor>,
    /// Whether the initializer has been applied. Never reset by
    /// re-allocation unless the storage itself was released.
    initialized: bool,
}

/// Arena of managed tensors plus the allocation/aliasing policy.
pub struct TensorPool {
    entries: Vec<PoolEntry>,
    by_name: HashMap<String, TensorId>,
    optimize: bool,
    allocated: bool,
    last_plan: Option<MemoryPlan>,
}

impl Default for TensorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorPool {
    pub fn new() -> Self {
        TensorPool {
            entries: Vec::new(),
            by_name: HashMap::new(),
            optimize: true,
            allocated: false,
            last_plan: None,
        }
    }

    /// Toggle whether packing is attempted at all. When disabled every
    /// tensor gets independent storage.
    pub fn set_optimizations(&mut self, enabled: bool) {
        self.optimize = enabled;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Requests ──

    /// Request a managed tensor.
    ///
    /// Re-requesting an existing name with the same shape and kind
    /// returns the existing handle and merges the access orders;
    /// a conflicting descriptor is an error.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        name: impl Into<String>,
        dim: TensorDim,
        dtype: DType,
        kind: TensorKind,
        lifespan: TensorLifespan,
        init: Initializer,
        trainable: bool,
        exec_orders: &[usize],
    ) -> Result<TensorId> {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            let entry = &mut self.entries[id.0];
            if entry.dim != dim || entry.kind != kind {
                return Err(Error::InvalidParameter {
                    node: name,
                    reason: format!(
                        "tensor re-requested with conflicting descriptor: {} {:?} vs {} {:?}",
                        entry.dim, entry.kind, dim, kind
                    ),
                });
            }
            entry.exec_orders.extend_from_slice(exec_orders);
            return Ok(id);
        }

        let id = TensorId(self.entries.len());
        self.entries.push(PoolEntry {
            name: name.clone(),
            dim,
            dtype,
            kind,
            lifespan,
            init,
            trainable,
            exec_orders: exec_orders.to_vec(),
            source: None,
            tensor: None,
            initialized: false,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Request a weight: trainable registration with model lifetime.
    pub fn request_weight(
        &mut self,
        name: impl Into<String>,
        dim: TensorDim,
        dtype: DType,
        init: Initializer,
        trainable: bool,
        exec_orders: &[usize],
    ) -> Result<TensorId> {
        self.request(
            name,
            dim,
            dtype,
            TensorKind::Weight,
            TensorLifespan::Max,
            init,
            trainable,
            exec_orders,
        )
    }

    /// Request the gradient paired with a weight.
    pub fn request_gradient(&mut self, weight: TensorId, exec_orders: &[usize]) -> Result<TensorId> {
        let (name, dim, dtype) = {
            let w = self.entry(weight)?;
            (format!("{}:grad", w.name), w.dim.clone(), w.dtype)
        };
        self.request(
            name,
            dim,
            dtype,
            TensorKind::WeightGradient,
            TensorLifespan::Backward,
            Initializer::Zeros,
            false,
            exec_orders,
        )
    }

    /// Request optimizer-state tensors paired with a weight, one per
    /// given shape, in the weight's lifespan bucket.
    pub fn request_optimizer_variables(
        &mut self,
        weight: TensorId,
        dims: Vec<TensorDim>,
    ) -> Result<Vec<TensorId>> {
        let (name, dtype, orders) = {
            let w = self.entry(weight)?;
            (w.name.clone(), w.dtype, w.exec_orders.clone())
        };
        let mut ids = Vec::with_capacity(dims.len());
        for (i, dim) in dims.into_iter().enumerate() {
            ids.push(self.request(
                format!("{}:opt{}", name, i),
                dim,
                dtype,
                TensorKind::OptimizerVariable,
                TensorLifespan::Max,
                Initializer::Zeros,
                false,
                &orders,
            )?);
        }
        Ok(ids)
    }

    /// Register an alias: a new logical tensor sharing `source`'s
    /// storage (in-place realization).
    pub fn view(
        &mut self,
        name: impl Into<String>,
        source: TensorId,
        dim: TensorDim,
        kind: TensorKind,
        exec_orders: &[usize],
    ) -> Result<TensorId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        let src = self.entry(source)?;
        if dim.elem_count() > src.dim.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: src.dim.clone(),
                got: dim,
            });
        }
        let (dtype, lifespan) = (src.dtype, src.lifespan);
        let id = TensorId(self.entries.len());
        self.entries.push(PoolEntry {
            name: name.clone(),
            dim,
            dtype,
            kind,
            lifespan,
            init: Initializer::None,
            trainable: false,
            exec_orders: exec_orders.to_vec(),
            source: Some(source),
            tensor: None,
            initialized: false,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Turn an already-requested root entry into an alias of `source`.
    ///
    /// This is the in-place optimization hook: the node's output tensor
    /// stops owning storage and shares its input's instead. Fails after
    /// allocation, on a size mismatch, or if it would create an alias
    /// cycle.
    pub fn make_dependent(&mut self, id: TensorId, source: TensorId) -> Result<()> {
        if self.allocated {
            return Err(Error::msg(
                "cannot re-alias tensors after allocation; deallocate first",
            ));
        }
        if self.root_of(source)? == id {
            return Err(Error::msg(format!(
                "aliasing '{}' onto '{}' would create a cycle",
                self.entry(id)?.name,
                self.entry(source)?.name
            )));
        }
        let src_elems = self.entry(source)?.dim.elem_count();
        let entry = self.entry(id)?;
        if entry.dim.elem_count() > src_elems {
            return Err(Error::ShapeMismatch {
                expected: self.entry(source)?.dim.clone(),
                got: self.entry(id)?.dim.clone(),
            });
        }
        self.entries[id.0].source = Some(source);
        Ok(())
    }

    /// Widen an existing tensor's recorded lifetime.
    pub fn extend(&mut self, id: TensorId, exec_orders: &[usize]) -> Result<()> {
        self.entry(id)?;
        self.entries[id.0].exec_orders.extend_from_slice(exec_orders);
        Ok(())
    }

    // ── Lookups ──

    fn entry(&self, id: TensorId) -> Result<&PoolEntry> {
        self.entries
            .get(id.0)
            .ok_or_else(|| Error::NotFound(format!("tensor id {}", id.0)))
    }

    pub fn id_by_name(&self, name: &str) -> Option<TensorId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: TensorId) -> Result<&str> {
        Ok(&self.entry(id)?.name)
    }

    pub fn dim(&self, id: TensorId) -> Result<&TensorDim> {
        Ok(&self.entry(id)?.dim)
    }

    pub fn kind(&self, id: TensorId) -> Result<TensorKind> {
        Ok(self.entry(id)?.kind)
    }

    pub fn is_dependent(&self, id: TensorId) -> Result<bool> {
        Ok(self.entry(id)?.source.is_some())
    }

    pub fn is_trainable(&self, id: TensorId) -> Result<bool> {
        Ok(self.entry(id)?.trainable)
    }

    /// All weight entries.
    pub fn weights(&self) -> Vec<TensorId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == TensorKind::Weight)
            .map(|(i, _)| TensorId(i))
            .collect()
    }

    /// Earliest recorded access order.
    pub fn first_access(&self, id: TensorId) -> Result<Option<usize>> {
        Ok(self.entry(id)?.exec_orders.iter().min().copied())
    }

    /// Latest recorded access order. A weight's gradient must be
    /// applied exactly at this order.
    pub fn last_access(&self, id: TensorId) -> Result<Option<usize>> {
        Ok(self.entry(id)?.exec_orders.iter().max().copied())
    }

    /// Resolve the alias chain to the storage-owning root.
    pub fn root_of(&self, id: TensorId) -> Result<TensorId> {
        let mut current = id;
        // The chain length is bounded by the entry count; anything
        // longer is a cycle introduced by a bad make_dependent call.
        for _ in 0..=self.entries.len() {
            match self.entry(current)?.source {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(Error::msg(format!(
            "alias cycle detected at tensor '{}'",
            self.entry(id)?.name
        )))
    }

    /// The materialized view for a handle.
    pub fn tensor(&self, id: TensorId) -> Result<Tensor> {
        let entry = self.entry(id)?;
        entry.tensor.clone().ok_or_else(|| {
            Error::msg(format!(
                "tensor '{}' is not allocated; call allocate_tensors first",
                entry.name
            ))
        })
    }

    pub fn tensor_by_name(&self, name: &str) -> Result<Tensor> {
        let id = self
            .id_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("tensor '{}'", name)))?;
        self.tensor(id)
    }

    /// The storage region a handle resolved to in the last plan.
    pub fn region_of(&self, id: TensorId) -> Result<Option<usize>> {
        let root = self.root_of(id)?;
        Ok(self
            .last_plan
            .as_ref()
            .and_then(|p| p.placements.get(&root).copied()))
    }

    // ── Allocation ──

    /// Access interval of a root, widened over all of its aliases.
    fn interval_of_root(&self, root: TensorId) -> (usize, usize) {
        let mut first = usize::MAX;
        let mut last = 0usize;
        let mut lifespan_max = false;
        for (i, e) in self.entries.iter().enumerate() {
            if self.root_of(TensorId(i)).ok() != Some(root) {
                continue;
            }
            if e.lifespan == TensorLifespan::Max {
                lifespan_max = true;
            }
            for &o in &e.exec_orders {
                first = first.min(o);
                last = last.max(o);
            }
        }
        if lifespan_max {
            return (0, usize::MAX);
        }
        if first == usize::MAX {
            // Never accessed; give it a zero-width interval at origin.
            (0, 0)
        } else {
            (first, last)
        }
    }

    fn skip_in_mode(&self, id: TensorId, mode: ExecMode) -> bool {
        mode == ExecMode::Inference
            && self
                .entry(id)
                .map(|e| e.kind.is_train_only())
                .unwrap_or(false)
    }

    /// Plan storage for every unallocated entry and materialize views.
    ///
    /// Root entries go through the planner; alias entries resolve to
    /// their root's storage. Weights are initialized exactly once, on
    /// first materialization.
    pub fn allocate(&mut self, mode: ExecMode) -> Result<()> {
        let planner: &dyn MemoryPlanner = if self.optimize {
            &IntervalPlanner
        } else {
            &NoReusePlanner
        };

        let mut requests = Vec::new();
        for i in 0..self.entries.len() {
            let id = TensorId(i);
            let e = &self.entries[i];
            if e.source.is_some()
                || e.tensor.is_some()
                || e.lifespan == TensorLifespan::Unmanaged
                || self.skip_in_mode(id, mode)
            {
                continue;
            }
            let (first, last) = self.interval_of_root(id);
            requests.push(PlanRequest {
                id,
                elems: e.dim.elem_count(),
                bytes: e.dim.byte_size(e.dtype),
                first,
                last,
            });
        }

        let plan = planner.plan(&requests);
        let regions: Vec<marten_core::Storage> = plan
            .region_sizes
            .iter()
            .map(|&n| Rc::new(std::cell::RefCell::new(vec![0.0; n])))
            .collect();

        for req in &requests {
            let region = plan.placements[&req.id];
            let e = &mut self.entries[req.id.0];
            let tensor = Tensor::from_storage(
                e.name.clone(),
                e.dim.clone(),
                e.dtype,
                Rc::clone(&regions[region]),
                0,
            )?;
            if !e.initialized {
                tensor.initialize(&e.init);
                e.initialized = true;
            }
            e.tensor = Some(tensor);
        }

        // Aliases resolve through the chain to a freshly placed root.
        for i in 0..self.entries.len() {
            let id = TensorId(i);
            if self.entries[i].source.is_none()
                || self.entries[i].tensor.is_some()
                || self.skip_in_mode(id, mode)
            {
                continue;
            }
            let root = self.root_of(id)?;
            let root_tensor = self.tensor(root)?;
            let e = &self.entries[i];
            let view = root_tensor.view_of(e.name.clone(), e.dim.clone())?;
            self.entries[i].tensor = Some(view);
        }

        debug!(
            "tensor pool allocated: {} tensors, {} regions, {} elements ({} planner)",
            requests.len(),
            plan.region_sizes.len(),
            plan.region_sizes.iter().sum::<usize>(),
            planner.name()
        );
        self.last_plan = Some(plan);
        self.allocated = true;
        Ok(())
    }

    /// Release storage. Weight and optimizer-state storage is kept
    /// unless `include_weights` is set; weights usually outlive a
    /// forward/backward cycle.
    pub fn deallocate(&mut self, include_weights: bool) {
        for e in &mut self.entries {
            if include_weights || !e.kind.is_persistent() {
                e.tensor = None;
                if include_weights {
                    // Values are gone; the next allocation re-initializes.
                    e.initialized = false;
                }
            }
        }
        self.allocated = false;
        self.last_plan = None;
    }

    /// Rewrite the batch axis of every batch-dependent entry and
    /// invalidate their storage. Weights and optimizer state keep
    /// their shapes and values.
    pub fn set_batch_size(&mut self, batch: usize) {
        for e in &mut self.entries {
            if e.kind.is_batch_dependent() {
                e.dim.set_batch(batch);
                e.tensor = None;
            }
        }
        self.allocated = false;
        self.last_plan = None;
    }
}
