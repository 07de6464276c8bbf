//! Project files: the persisted flow graph and step sequence.
//!
//! A project file is one JSON object. Every key but `steps` is a node entry
//! named after its reference image; `steps`, when present, holds the last
//! compiled sequence as `Step1..StepN`. Connections keep the historical
//! orientation where `to` names the origin and `from` the destination; the
//! in-memory graph uses the natural direction.
//!
//! Node names are bare image file names looked up in the settings'
//! `images_dir`; stored step locations are paths relative to the working
//! directory (for example `detect/start.png`).
//!
//! Example:
//! use clickflow::project::load_steps_from_path;
//!
//! let steps = load_steps_from_path("SaveData/project.json", Path::new(""))?;

pub mod loader;
pub mod models;

pub use models::{
    ConnectionRecord, DetailedStep, GraphDocument, NodeEntry, SettingsRecord, StepRecord,
    StepSequenceDoc,
};

pub use loader::{
    load_document_from_path, load_document_from_reader, load_graph_from_path,
    load_steps_from_path, save_graph_to_path, save_project, steps_from_doc, steps_to_doc,
};
