//! Inference of prerequisite edges from declared locations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::error;

use kiln_core::{Error, Result};

use crate::step::{StepRef, link_steps};

/// Walks the graph rooted at `root` once, linking every step that produces
/// a content location before every step that consumes it.
///
/// Generation runs when the root is first scheduled; later schedule calls
/// are no-ops. A consumed location with no producer in the graph is
/// reported and left unlinked: the step will resolve it through the
/// content index or fail its input hashing. Producer cycles are an error.
///
/// # Errors
/// Returns [`Error::CyclicDependency`] when the inferred edges form a
/// cycle between producers.
pub(crate) fn generate_dependencies(root: &StepRef) -> Result<()> {
    if !root.core().mark_dependencies_processed() {
        return Ok(());
    }

    let mut producers: HashMap<String, Producer> = HashMap::new();
    let mut visited = HashSet::new();
    collect_producers(root, &mut producers, &mut visited);
    link_producers(&producers)
}

struct Producer {
    step: StepRef,
    consumed: HashSet<String>,
}

/// Registers every producer step under `step`, keyed by the content
/// location it is the canonical producer of. The first producer of a
/// location wins; the graph does not support two producers for one
/// location.
fn collect_producers(
    step: &StepRef,
    producers: &mut HashMap<String, Producer>,
    visited: &mut HashSet<crate::step::StepId>,
) {
    if !visited.insert(step.core().id()) {
        return;
    }
    step.core().mark_dependencies_processed();

    if let Some(location) = step.output_location() {
        if location.is_content() {
            if producers.contains_key(&location.path) {
                error!(
                    step = step.core().title(),
                    location = %location,
                    "a producer for this location is already registered"
                );
                return;
            }
            let mut consumed = HashSet::new();
            collect_consumed_locations(step, &mut consumed);
            producers.insert(
                location.path.clone(),
                Producer {
                    step: Arc::clone(step),
                    consumed,
                },
            );
        }
    }

    for child in step.children() {
        collect_producers(&child, producers, visited);
    }
    for prerequisite in step.core().prerequisites() {
        collect_producers(&prerequisite, producers, visited);
    }
}

/// Content locations the leaves under `step` declare as inputs.
fn collect_consumed_locations(step: &StepRef, consumed: &mut HashSet<String>) {
    if let Some(leaf) = step.as_command() {
        for url in leaf.command().input_files() {
            if url.is_content() {
                consumed.insert(url.path);
            }
        }
    }
    for child in step.children() {
        collect_consumed_locations(&child, consumed);
    }
}

fn link_producers(producers: &HashMap<String, Producer>) -> Result<()> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for location in producers.keys() {
        nodes.insert(location, graph.add_node(location));
    }

    for (location, consumer) in producers {
        for consumed in &consumer.consumed {
            let Some(producer) = producers.get(consumed) else {
                error!(
                    step = consumer.step.core().title(),
                    location = consumed,
                    "no producer found for consumed location; if it is not in the \
                     content index the consumer will fail"
                );
                continue;
            };
            if producer.step.core().id() == consumer.step.core().id() {
                continue;
            }
            link_steps(&producer.step, &consumer.step);
            graph.add_edge(nodes[consumed.as_str()], nodes[location.as_str()], ());
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| Error::CyclicDependency(graph[cycle.node_id()].to_owned()))
}
