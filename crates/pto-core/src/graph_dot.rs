//! DOT graph visualization for task graphs.
//!
//! Generates Graphviz DOT format showing tasks, their core class and
//! current state, and the dependency edges between them.

use crate::graph::TaskGraph;
use crate::task::{CoreType, TaskState};

/// Generate a DOT graph from a task graph.
///
/// # Example
///
/// ```ignore
/// let dot = to_task_graph_dot(&graph);
/// std::fs::write("tasks.dot", dot)?;
/// // Render with: dot -Tpng tasks.dot -o tasks.png
/// ```
pub fn to_task_graph_dot(graph: &TaskGraph) -> String {
    let mut dot = String::new();
    dot.push_str("digraph task_graph {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=\"rounded,filled\"];\n\n");

    for task in graph.tasks() {
        let state = graph.state(task.id).unwrap_or(TaskState::Unpublished);
        let color = match task.core_type {
            CoreType::Aic => "lightsalmon",
            CoreType::Aiv => "lightblue",
        };
        let style = if state.is_published() { "" } else { ", style=dashed" };
        dot.push_str(&format!(
            "  task_{} [label=\"T{} func={}\\n{} {:?}\", fillcolor={}{}];\n",
            task.id,
            task.id,
            task.func_id,
            task.core_type.name(),
            state,
            color,
            style
        ));
    }

    dot.push('\n');
    for task in graph.tasks() {
        for succ in graph.successors(task.id) {
            dot.push_str(&format!("  task_{} -> task_{};\n", task.id, succ));
        }
    }

    dot.push_str("}\n");
    dot
}
