//! Plan-graph rendering for offline inspection.

use crate::planner::PlanGraph;
use petgraph::dot::{Config, Dot};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

/// Write the plan graph in Graphviz DOT format.
pub fn write_dot(graph: &PlanGraph, path: &Path) -> io::Result<()> {
    let dot = format!("{:?}", Dot::with_config(graph, &[Config::EdgeNoLabel]));
    fs::write(path, dot)
}

/// Render the plan graph to a PNG next to `dot_path`, via the Graphviz
/// `dot` tool. Returns the PNG path, or the DOT path when Graphviz is not
/// installed.
pub fn render_png(graph: &PlanGraph, dot_path: &Path) -> io::Result<PathBuf> {
    write_dot(graph, dot_path)?;
    let png_path = dot_path.with_extension("png");
    let status = Command::new("dot")
        .arg("-Tpng")
        .arg("-o")
        .arg(&png_path)
        .arg(dot_path)
        .status();
    match status {
        Ok(status) if status.success() => Ok(png_path),
        Ok(status) => {
            warn!(%status, "graphviz dot failed, keeping the .dot file");
            Ok(dot_path.to_path_buf())
        }
        Err(err) => {
            warn!(%err, "graphviz dot not available, keeping the .dot file");
            Ok(dot_path.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_export_contains_workflow_ids() {
        let mut graph = PlanGraph::new();
        let a = graph.add_node(1);
        let b = graph.add_node(2);
        graph.add_edge(a, b, ());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.dot");
        write_dot(&graph, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("digraph"));
        assert!(contents.contains('1'));
        assert!(contents.contains('2'));
    }
}
