// Memory planners — packing tensor lifetimes into storage regions
//
// A planner sees one request per root tensor: its size and the
// execution-order interval [first, last] over which its storage must be
// valid. It answers with a region assignment. Two tensors may land in
// the same region only if their intervals are disjoint and the region
// is large enough for both — the planner is the only component allowed
// to make that call, which keeps aliasing decisions auditable.

use std::collections::HashMap;

use crate::pool::TensorId;

/// One root tensor's storage demand.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub id: TensorId,
    /// Element count (regions are sized in elements).
    pub elems: usize,
    /// Byte footprint at the tensor's format; drives the size heuristic.
    pub bytes: usize,
    /// First execution order at which the tensor is accessed.
    pub first: usize,
    /// Last execution order at which the tensor is accessed.
    pub last: usize,
}

impl PlanRequest {
    fn overlaps(&self, other_first: usize, other_last: usize) -> bool {
        self.first <= other_last && other_first <= self.last
    }
}

/// The planner's answer: how many regions, how large, and who goes where.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    /// Region sizes in elements.
    pub region_sizes: Vec<usize>,
    /// Tensor → region index.
    pub placements: HashMap<TensorId, usize>,
}

/// Strategy seam for storage packing.
pub trait MemoryPlanner {
    fn name(&self) -> &'static str;
    fn plan(&self, requests: &[PlanRequest]) -> MemoryPlan;
}

/// One region per tensor; no reuse at all.
///
/// Selected when memory optimizations are disabled, so layer math can
/// be debugged in isolation from aliasing.
pub struct NoReusePlanner;

impl MemoryPlanner for NoReusePlanner {
    fn name(&self) -> &'static str {
        "no-reuse"
    }

    fn plan(&self, requests: &[PlanRequest]) -> MemoryPlan {
        let mut plan = MemoryPlan::default();
        for req in requests {
            plan.placements.insert(req.id, plan.region_sizes.len());
            plan.region_sizes.push(req.elems);
        }
        plan
    }
}

/// Greedy interval packing.
///
/// Requests are placed in ascending first-access order, largest byte
/// footprint first among ties, into the first region whose incumbent
/// intervals are all disjoint from the candidate and whose size fits.
/// Large tensors claim regions early so smaller later tensors slot into
/// the leftover capacity, which bounds fragmentation.
pub struct IntervalPlanner;

struct RegionState {
    elems: usize,
    intervals: Vec<(usize, usize)>,
}

impl MemoryPlanner for IntervalPlanner {
    fn name(&self) -> &'static str {
        "interval-packing"
    }

    fn plan(&self, requests: &[PlanRequest]) -> MemoryPlan {
        let mut order: Vec<&PlanRequest> = requests.iter().collect();
        order.sort_by(|a, b| a.first.cmp(&b.first).then(b.bytes.cmp(&a.bytes)));

        let mut regions: Vec<RegionState> = Vec::new();
        let mut plan = MemoryPlan::default();

        for req in order {
            let slot = regions.iter().position(|r| {
                r.elems >= req.elems
                    && r.intervals.iter().all(|&(f, l)| !req.overlaps(f, l))
            });
            let region = match slot {
                Some(i) => i,
                None => {
                    regions.push(RegionState {
                        elems: req.elems,
                        intervals: Vec::new(),
                    });
                    regions.len() - 1
                }
            };
            regions[region].intervals.push((req.first, req.last));
            plan.placements.insert(req.id, region);
        }

        plan.region_sizes = regions.into_iter().map(|r| r.elems).collect();
        plan
    }
}
