//! Topological op scheduler.
//!
//! Kahn's algorithm over every node of the graph with the lowest ready
//! [`NodeId`] popped first, so the order is deterministic and follows
//! insertion order where the graph allows it. Only op nodes are emitted.
//! Ignored nodes count as already executed.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use balancer_core::{BalancerError, BalancerResult, Graph, NodeId, Schedule, Scheduler, SchedulerConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct TopologicalScheduler;

impl Scheduler for TopologicalScheduler {
    fn schedule(&self, graph: &Graph, config: &SchedulerConfig) -> BalancerResult<Schedule> {
        let live = |id: NodeId| !config.ignored_nodes.contains(&id);

        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> = graph.nodes().filter(|n| live(n.id)).map(|n| (n.id, 0)).collect();

        let mut add_dependency = |from: NodeId, to: NodeId, in_degree: &mut HashMap<NodeId, usize>| {
            successors.entry(from).or_default().push(to);
            *in_degree.entry(to).or_default() += 1;
        };

        for edge in graph.edges() {
            if live(edge.producer) && live(edge.consumer) {
                add_dependency(edge.producer, edge.consumer, &mut in_degree);
            }
        }

        for constraint in &config.constraints {
            let present: Vec<NodeId> = constraint
                .iter()
                .filter_map(|name| graph.find(name))
                .filter(|id| live(*id))
                .collect();
            for pair in present.windows(2) {
                add_dependency(pair[0], pair[1], &mut in_degree);
            }
        }

        let mut ready: BTreeSet<NodeId> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(in_degree.len());
        let mut schedule = Schedule::new();

        while let Some(id) = ready.pop_first() {
            visited.insert(id);
            let node = graph.node(id);
            if node.is_op() {
                schedule.push(node.name.clone());
            }
            for next in successors.get(&id).map(|v| v.as_slice()).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*next);
                    }
                }
            }
        }

        if visited.len() != in_degree.len() {
            let mut stuck: Vec<&str> = in_degree
                .keys()
                .filter(|id| !visited.contains(id))
                .map(|id| graph.node(*id).name.as_str())
                .collect();
            stuck.sort_unstable();
            return Err(BalancerError::precondition(format!(
                "graph {} has a cycle through {}",
                graph.name(),
                stuck.join(", ")
            )));
        }

        debug!(graph = %graph.name(), ops = schedule.len(), ignored = config.ignored_nodes.len(), "scheduled");
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer_core::{OpAttrs, Shape};

    fn make_diamond() -> Graph {
        // in -> a -> {b, c} -> d -> out
        let mut g = Graph::new("diamond");
        let input = g.add_input("in", Shape::tiles(1, 1)).unwrap();
        let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let b = g.add_op("b", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let c = g.add_op("c", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let d = g.add_op("d", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let out = g.add_output("out", Shape::tiles(1, 1)).unwrap();
        g.connect(input, 0, a, 0);
        g.connect(a, 0, b, 0);
        g.connect(a, 0, c, 0);
        g.connect(b, 0, d, 0);
        g.connect(c, 0, d, 1);
        g.connect(d, 0, out, 0);
        g
    }

    #[test]
    fn emits_ops_in_dependency_order() {
        let g = make_diamond();
        let schedule = TopologicalScheduler.schedule(&g, &SchedulerConfig::default()).unwrap();
        assert_eq!(schedule, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn constraints_reorder_independent_ops() {
        let g = make_diamond();
        let config = SchedulerConfig {
            constraints: vec![vec!["c".to_string(), "b".to_string()]],
            ..SchedulerConfig::default()
        };
        let schedule = TopologicalScheduler.schedule(&g, &config).unwrap();
        assert_eq!(schedule, vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn ignored_nodes_are_left_out() {
        let g = make_diamond();
        let config = SchedulerConfig {
            ignored_nodes: [g.find("a").unwrap(), g.find("b").unwrap()].into_iter().collect(),
            ..SchedulerConfig::default()
        };
        let schedule = TopologicalScheduler.schedule(&g, &config).unwrap();
        assert_eq!(schedule, vec!["c", "d"]);
    }

    #[test]
    fn cycle_is_a_precondition_error() {
        let mut g = Graph::new("loop");
        let a = g.add_op("a", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        let b = g.add_op("b", OpAttrs::new("add"), Shape::tiles(1, 1)).unwrap();
        g.connect(a, 0, b, 0);
        g.connect(b, 0, a, 0);
        let err = TopologicalScheduler.schedule(&g, &SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, BalancerError::Precondition(_)));
    }
}
