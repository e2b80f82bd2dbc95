//! DAG resolution for pipeline tasks.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use sluice_core::pipeline::{PipelineDefinition, TaskDefinition};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("pipeline has no tasks")]
    EmptyPipeline,
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("cycle detected in task dependencies at {0}")]
    CycleDetected(String),
}

impl From<DagError> for sluice_core::Error {
    fn from(err: DagError) -> Self {
        sluice_core::Error::InvalidGraph(err.to_string())
    }
}

/// A node in the pipeline DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    pub definition: TaskDefinition,
}

/// Directed acyclic graph of task dependencies. Edges point from a task to
/// the tasks that depend on it.
#[derive(Debug, Clone)]
pub struct PipelineDag {
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl PipelineDag {
    /// Build and validate a DAG from a pipeline definition.
    pub fn build(pipeline: &PipelineDefinition) -> Result<Self, DagError> {
        if pipeline.tasks.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for task in &pipeline.tasks {
            if name_to_index.contains_key(&task.name) {
                return Err(DagError::DuplicateTask(task.name.clone()));
            }
            let idx = graph.add_node(DagNode {
                name: task.name.clone(),
                definition: task.clone(),
            });
            name_to_index.insert(task.name.clone(), idx);
        }

        for task in &pipeline.tasks {
            let task_idx = name_to_index[&task.name];
            for dep in &task.depends_on {
                let dep_idx =
                    name_to_index
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            task: task.name.clone(),
                            dependency: dep.clone(),
                        })?;
                graph.update_edge(*dep_idx, task_idx, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| DagError::CycleDetected(graph[cycle.node_id()].name.clone()))?;

        Ok(Self {
            graph,
            name_to_index,
            order,
        })
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Every task reachable from the given task, excluding itself.
    pub fn downstream(&self, name: &str) -> HashSet<String> {
        let Some(&start) = self.name_to_index.get(name) else {
            return HashSet::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut reached = HashSet::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                reached.insert(self.graph[idx].name.clone());
            }
        }
        reached
    }

    /// Tasks in an order where every task follows all of its dependencies.
    pub fn topological_order(&self) -> Vec<&DagNode> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::ids::PipelineId;
    use sluice_core::pipeline::{OverlapPolicy, Params, TaskKind};

    fn make_task(name: &str, depends_on: Vec<&str>) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            description: None,
            run: TaskKind::Noop,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            retry: None,
            timeout_secs: None,
        }
    }

    fn pipeline(tasks: Vec<TaskDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            id: PipelineId::new("test"),
            name: None,
            description: None,
            tasks,
            triggers: vec![],
            params: Params::new(),
            overlap: OverlapPolicy::default(),
            max_concurrent_tasks: None,
        }
    }

    #[test]
    fn test_linear_dag() {
        let dag = PipelineDag::build(&pipeline(vec![
            make_task("deploy", vec!["test"]),
            make_task("build", vec![]),
            make_task("test", vec!["build"]),
        ]))
        .unwrap();

        assert_eq!(dag.task_count(), 3);

        let order: Vec<_> = dag
            .topological_order()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn test_fan_out_and_downstream() {
        let dag = PipelineDag::build(&pipeline(vec![
            make_task("a", vec![]),
            make_task("b", vec!["a"]),
            make_task("c", vec!["a"]),
            make_task("d", vec!["b"]),
            make_task("e", vec![]),
        ]))
        .unwrap();

        let downstream = dag.downstream("a");
        assert_eq!(downstream.len(), 3);
        assert!(downstream.contains("d"));
        assert!(!downstream.contains("e"));
        assert!(dag.downstream("e").is_empty());
        assert_eq!(dag.downstream("b"), HashSet::from(["d".to_string()]));
    }

    #[test]
    fn test_rejects_cycle() {
        let err = PipelineDag::build(&pipeline(vec![
            make_task("a", vec!["c"]),
            make_task("b", vec!["a"]),
            make_task("c", vec!["b"]),
        ]))
        .unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(_)));
    }

    #[test]
    fn test_rejects_self_dependency() {
        let err = PipelineDag::build(&pipeline(vec![make_task("a", vec!["a"])])).unwrap_err();
        assert_eq!(err, DagError::CycleDetected("a".to_string()));
    }

    #[test]
    fn test_rejects_dangling_dependency() {
        let err = PipelineDag::build(&pipeline(vec![make_task("a", vec!["ghost"])])).unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        let err = PipelineDag::build(&pipeline(vec![
            make_task("a", vec![]),
            make_task("a", vec![]),
        ]))
        .unwrap_err();
        assert_eq!(err, DagError::DuplicateTask("a".to_string()));

        assert_eq!(
            PipelineDag::build(&pipeline(vec![])).unwrap_err(),
            DagError::EmptyPipeline
        );
    }
}
