use anyhow::{Context, Result, anyhow, bail};
use schemars::{Schema, schema_for};
use serde_valid::Validate;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use super::models::{DetectMode, Settings};

/// Load settings from a string slice.
pub fn load_from_str(s: &str) -> Result<Settings> {
    let settings: Settings =
        serde_json::from_str(s).context("Failed to parse JSON settings string into Settings")?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Load settings from any reader (e.g., a file).
pub fn load_from_reader<R: Read>(reader: R) -> Result<Settings> {
    let settings: Settings =
        serde_json::from_reader(reader).context("Failed to parse JSON settings from reader")?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Load settings from a file path synchronously.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open settings file {}", path_ref.display()))?;
    let settings = load_from_reader(file)
        .with_context(|| format!("Invalid settings file {}", path_ref.display()))?;
    debug!(target: "clickflow::config", "Loaded settings from {}", path_ref.display());
    Ok(settings)
}

/// Load settings from a file path asynchronously (Tokio).
pub async fn load_from_path_async<P: AsRef<Path>>(path: P) -> Result<Settings> {
    use tokio::fs;
    let path_ref = path.as_ref();
    let bytes = fs::read(path_ref)
        .await
        .with_context(|| format!("Failed to read settings file {}", path_ref.display()))?;
    let settings: Settings = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse JSON settings from {}", path_ref.display()))?;
    validate_settings(&settings)?;
    debug!(target: "clickflow::config", "Loaded settings from {}", path_ref.display());
    Ok(settings)
}

/// Generate the JSON Schema for the Settings model.
pub fn generate_schema() -> Schema {
    schema_for!(Settings)
}

/// Write the JSON Schema for the Settings model to any writer (pretty-printed).
pub fn write_schema_to_writer<W: Write>(mut writer: W) -> Result<()> {
    let schema = generate_schema();
    let json = serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?;
    writer
        .write_all(json.as_bytes())
        .context("Failed to write schema to writer")?;
    Ok(())
}

/// Range checks from the model's `#[validate]` attributes, then cross-field rules:
/// - remote mode needs an adb executable to call.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    settings
        .validate()
        .map_err(|errors| anyhow!("Settings out of range: {errors}"))?;

    if settings.detect_mode == DetectMode::Remote && settings.adb_path.as_os_str().is_empty() {
        bail!("Remote detect mode requires a non-empty `adb_path`");
    }
    if settings
        .device_serial
        .as_deref()
        .is_some_and(|serial| serial.trim().is_empty())
    {
        bail!("`device_serial` must not be blank; omit it to use the only attached device");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = load_from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.images_dir, Path::new("detect"));
    }

    #[test]
    fn legacy_mode_names_are_accepted() {
        let settings = load_from_str(r#"{"detect_mode": "ADB", "device_serial": "emulator-5554"}"#)
            .unwrap();
        assert_eq!(settings.detect_mode, DetectMode::Remote);
        assert_eq!(settings.device_serial.as_deref(), Some("emulator-5554"));

        let settings = load_from_str(r#"{"detect_mode": "Windows"}"#).unwrap();
        assert_eq!(settings.detect_mode, DetectMode::Local);
    }

    #[test]
    fn poll_interval_is_range_checked() {
        assert!(load_from_str(r#"{"poll_interval_ms": 500}"#).is_ok());
        assert!(load_from_str(r#"{"poll_interval_ms": 250}"#).is_err());
        assert!(load_from_str(r#"{"poll_interval_ms": 1500}"#).is_err());
    }

    #[test]
    fn pyramid_depth_is_automatic_unless_set() {
        assert_eq!(load_from_str("{}").unwrap().coarse_levels, None);
        assert_eq!(
            load_from_str(r#"{"coarse_levels": 0}"#).unwrap().coarse_levels,
            Some(0)
        );
        assert!(load_from_str(r#"{"coarse_levels": 5}"#).is_err());
    }

    #[test]
    fn remote_without_adb_is_rejected() {
        let err = load_from_str(r#"{"detect_mode": "remote", "adb_path": ""}"#).unwrap_err();
        assert!(err.to_string().contains("adb_path"));
    }

    #[test]
    fn blank_serial_is_rejected() {
        assert!(load_from_str(r#"{"device_serial": "  "}"#).is_err());
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        assert!(load_from_str(r#"{"detect_mode": "vnc"}"#).is_err());
    }

    #[test]
    fn schema_mentions_every_field() {
        let mut out = Vec::new();
        write_schema_to_writer(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        for field in ["detect_mode", "poll_interval_ms", "coarse_levels", "dry_run"] {
            assert!(text.contains(field), "schema lacks {field}");
        }
    }

    #[tokio::test]
    async fn async_loader_reads_files() {
        let dir = std::env::temp_dir().join(format!("clickflow-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"settle_delay_ms": 250, "dry_run": true}"#).unwrap();

        let settings = load_from_path_async(&path).await.unwrap();
        assert_eq!(settings.settle_delay(), Duration::from_millis(250));
        assert!(settings.dry_run);
        assert_eq!(load_from_path(&path).unwrap(), settings);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
