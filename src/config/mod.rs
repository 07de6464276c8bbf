//! Runtime settings: data model plus loading and validation helpers.
//!
//! Example:
//! use clickflow::config::{Settings, load_from_path};
//!
//! let settings = load_from_path("settings.json")?;

pub mod loader;
pub mod models;

pub use models::{DetectMode, Settings};

pub use loader::{
    generate_schema, load_from_path, load_from_path_async, load_from_reader, load_from_str,
    validate_settings, write_schema_to_writer,
};
