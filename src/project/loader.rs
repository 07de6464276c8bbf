use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use super::models::{
    ConnectionRecord, DetailedStep, GraphDocument, NodeEntry, SettingsRecord, StepRecord,
    StepSequenceDoc,
};
use crate::graph::{FlowGraph, GraphError, NodeId};
use crate::model::{CompiledSequence, ReferenceImage, Step, StepSettings};

impl FlowGraph {
    /// Rebuild a graph from its persisted form. Image names resolve against
    /// `images_dir`; images are decoded lazily, on first use.
    ///
    /// Connections naming an unknown node, or repeating an existing edge, are
    /// skipped with a warning.
    pub fn from_document(doc: &GraphDocument, images_dir: &Path) -> Result<FlowGraph> {
        let mut graph = FlowGraph::new();
        let mut ids: HashMap<&str, NodeId> = HashMap::with_capacity(doc.nodes.len());

        for (name, entry) in &doc.nodes {
            let settings = match &entry.settings {
                Some(record) => record
                    .to_settings()
                    .with_context(|| format!("Invalid settings for node '{name}'"))?,
                None => StepSettings::default(),
            };
            let image = ReferenceImage::from_path(name.as_str(), images_dir.join(name));
            let id = graph.add_node(name.as_str(), image, settings, entry.position)?;
            ids.insert(name.as_str(), id);
        }

        for (name, entry) in &doc.nodes {
            for connection in &entry.connections {
                let (Some(&origin), Some(&destination)) = (
                    ids.get(connection.origin()),
                    ids.get(connection.destination()),
                ) else {
                    warn!(
                        target: "clickflow::project",
                        node = %name,
                        origin = %connection.origin(),
                        destination = %connection.destination(),
                        "Skipping connection to an unknown node"
                    );
                    continue;
                };
                match graph.connect(origin, destination) {
                    Ok(_) => {}
                    // Listed under both of its nodes.
                    Err(GraphError::DuplicateEdge { .. }) => {
                        debug!(target: "clickflow::project", node = %name, "Connection already loaded");
                    }
                    Err(err) => {
                        warn!(target: "clickflow::project", node = %name, error = %err, "Skipping connection");
                    }
                }
            }
        }

        Ok(graph)
    }

    /// Persisted form of the graph. Each connection is listed under its origin node.
    pub fn to_document(&self) -> GraphDocument {
        let nodes = self
            .nodes()
            .map(|node| {
                let connections = self
                    .successors(node.id())
                    .into_iter()
                    .filter_map(|next| self.node(next))
                    .map(|next| ConnectionRecord::between(node.name(), next.name()))
                    .collect();
                let entry = NodeEntry {
                    position: node.position(),
                    connections,
                    settings: Some(SettingsRecord::from(node.settings())),
                };
                (node.name().to_string(), entry)
            })
            .collect();
        GraphDocument { nodes, steps: None }
    }
}

/// Persisted form of a compiled sequence. Each location is the step's image
/// path as resolved at load time (`images_dir/<name>` for graph nodes), or its
/// name for in-memory images.
pub fn steps_to_doc(sequence: &CompiledSequence) -> StepSequenceDoc {
    StepSequenceDoc(
        sequence
            .iter()
            .map(|step| {
                let location = match step.image.path() {
                    Some(path) => path.to_string_lossy().into_owned(),
                    None => step.name().to_string(),
                };
                StepRecord::Detailed(DetailedStep {
                    location,
                    settings: SettingsRecord::from(&step.settings),
                })
            })
            .collect(),
    )
}

/// Normalize persisted steps into a runnable sequence.
///
/// Step locations are paths relative to `base_dir` (the working directory the
/// project was saved from, usually an empty path); absolute locations are kept
/// as they are. Unlike node names they are not looked up in `images_dir`.
pub fn steps_from_doc(doc: &StepSequenceDoc, base_dir: &Path) -> Result<CompiledSequence> {
    doc.0
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let settings = record
                .settings()
                .to_settings()
                .with_context(|| format!("Invalid settings for Step{}", i + 1))?;
            let location = record.location();
            let image = ReferenceImage::from_path(location, base_dir.join(location));
            Ok(Step::new(image, settings))
        })
        .collect::<Result<Vec<_>>>()
        .map(CompiledSequence::new)
}

/// Parse a project document from any reader.
pub fn load_document_from_reader<R: Read>(reader: R) -> Result<GraphDocument> {
    serde_json::from_reader(reader).context("Failed to parse JSON project document")
}

/// Parse the project file at `path`.
pub fn load_document_from_path<P: AsRef<Path>>(path: P) -> Result<GraphDocument> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open project file {}", path_ref.display()))?;
    let doc = load_document_from_reader(file)
        .with_context(|| format!("Invalid project file {}", path_ref.display()))?;
    debug!(
        target: "clickflow::project",
        nodes = doc.nodes.len(),
        has_steps = doc.steps.is_some(),
        "Loaded project from {}", path_ref.display()
    );
    Ok(doc)
}

pub fn load_graph_from_path<P: AsRef<Path>>(path: P, images_dir: &Path) -> Result<FlowGraph> {
    let doc = load_document_from_path(path)?;
    FlowGraph::from_document(&doc, images_dir)
}

/// Load the `steps` of a project file, resolving locations against `base_dir`;
/// a file without `steps` yields an empty sequence.
pub fn load_steps_from_path<P: AsRef<Path>>(path: P, base_dir: &Path) -> Result<CompiledSequence> {
    let doc = load_document_from_path(path)?;
    match &doc.steps {
        Some(steps) => steps_from_doc(steps, base_dir),
        None => Ok(CompiledSequence::default()),
    }
}

/// Write the graph alone (pretty JSON).
pub fn save_graph_to_path<P: AsRef<Path>>(graph: &FlowGraph, path: P) -> Result<()> {
    write_document(&graph.to_document(), path.as_ref())
}

/// Write the graph together with its compiled sequence under `steps`.
pub fn save_project<P: AsRef<Path>>(
    graph: &FlowGraph,
    sequence: &CompiledSequence,
    path: P,
) -> Result<()> {
    let mut doc = graph.to_document();
    doc.steps = Some(steps_to_doc(sequence));
    write_document(&doc, path.as_ref())
}

fn write_document(doc: &GraphDocument, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create project file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, doc)
        .with_context(|| format!("Failed to serialize project to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write project file {}", path.display()))?;
    info!(
        target: "clickflow::project",
        nodes = doc.nodes.len(),
        steps = doc.steps.as_ref().map_or(0, |s| s.0.len()),
        "Saved project to {}", path.display()
    );
    Ok(())
}
