//! Per-pipeline admission control for runs.

use sluice_core::ids::{PipelineId, RunId};
use sluice_core::pipeline::OverlapPolicy;
use std::collections::{HashMap, HashSet, VecDeque};

/// Outcome of asking the gate to admit a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The run may start now.
    Start,
    /// The run waits behind `position` earlier runs.
    Queued { position: usize },
    /// The run must not be created.
    Rejected { reason: String },
}

#[derive(Debug)]
struct PipelineSlots<T> {
    active: HashSet<RunId>,
    waiting: VecDeque<(RunId, T)>,
}

impl<T> Default for PipelineSlots<T> {
    fn default() -> Self {
        Self {
            active: HashSet::new(),
            waiting: VecDeque::new(),
        }
    }
}

/// Tracks active and waiting runs per pipeline.
///
/// This is a derived index over the run store: it only knows about runs this
/// process admitted.
#[derive(Debug)]
pub struct OverlapGate<T> {
    pipelines: HashMap<PipelineId, PipelineSlots<T>>,
}

impl<T> OverlapGate<T> {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// Decide whether a new run may start, wait, or must be rejected.
    ///
    /// `Start` marks the run active; `Queued` keeps `payload` until a slot
    /// frees up.
    pub fn admit(
        &mut self,
        pipeline_id: &PipelineId,
        run_id: RunId,
        policy: &OverlapPolicy,
        payload: T,
    ) -> Admission {
        let slots = self.pipelines.entry(pipeline_id.clone()).or_default();

        let busy = !slots.active.is_empty() || !slots.waiting.is_empty();
        match policy {
            OverlapPolicy::Allow => {
                slots.active.insert(run_id);
                Admission::Start
            }
            _ if !busy => {
                slots.active.insert(run_id);
                Admission::Start
            }
            OverlapPolicy::Reject => Admission::Rejected {
                reason: "another run of this pipeline is active".to_string(),
            },
            OverlapPolicy::Queue { max_depth } => {
                if slots.waiting.len() >= *max_depth {
                    return Admission::Rejected {
                        reason: format!("run queue is full ({} waiting)", slots.waiting.len()),
                    };
                }
                slots.waiting.push_back((run_id, payload));
                Admission::Queued {
                    position: slots.waiting.len(),
                }
            }
        }
    }

    /// Mark a run finished and hand back the next waiting run, now active.
    pub fn release(&mut self, pipeline_id: &PipelineId, run_id: RunId) -> Option<(RunId, T)> {
        let slots = self.pipelines.get_mut(pipeline_id)?;
        slots.active.remove(&run_id);

        let next = if slots.active.is_empty() {
            slots.waiting.pop_front()
        } else {
            None
        };
        if let Some((next_id, _)) = &next {
            slots.active.insert(*next_id);
        }
        if slots.active.is_empty() && slots.waiting.is_empty() {
            self.pipelines.remove(pipeline_id);
        }
        next
    }

    /// Remove a waiting run, returning its payload.
    pub fn withdraw(&mut self, pipeline_id: &PipelineId, run_id: RunId) -> Option<T> {
        let slots = self.pipelines.get_mut(pipeline_id)?;
        let pos = slots.waiting.iter().position(|(id, _)| *id == run_id)?;
        let (_, payload) = slots.waiting.remove(pos)?;
        if slots.active.is_empty() && slots.waiting.is_empty() {
            self.pipelines.remove(pipeline_id);
        }
        Some(payload)
    }
}

impl<T> Default for OverlapGate<T> {
    fn default() -> Self {
        Self::new()
    }
}
