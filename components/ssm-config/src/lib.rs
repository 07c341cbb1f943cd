//! Layered JSON configuration loading for the session server manager.
//!
//! Three config files are read in order — base, SoC-specific, overrides —
//! and merged key by key, last-file-wins, except `extraEnvVariables`, which
//! is appended rather than replaced. Only `base` is required to exist; a
//! missing SoC or overrides file is not an error, but a present-and-
//! malformed one is.

mod error;
mod merged;
mod raw;

pub use error::{Error, Result};
pub use merged::ServerManagerConfig;

use std::path::Path;

use raw::RawConfig;

fn read_layer(path: &Path, required: bool) -> Result<Option<RawConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(source) if !required && source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None);
        }
        Err(source) => {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let raw: RawConfig = serde_json::from_str(&contents).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(raw))
}

/// Loads and merges up to three config layers. `base` must exist; `soc`
/// and `overrides` are optional and silently skipped if their path is
/// `None` or the file is absent.
pub fn load(base: &Path, soc: Option<&Path>, overrides: Option<&Path>) -> Result<ServerManagerConfig> {
    let mut layers = Vec::with_capacity(3);
    layers.push(read_layer(base, true)?.unwrap_or_default());
    if let Some(path) = soc {
        if let Some(layer) = read_layer(path, false)? {
            log::debug!("loaded SoC-specific config from {}", path.display());
            layers.push(layer);
        }
    }
    if let Some(path) = overrides {
        if let Some(layer) = read_layer(path, false)? {
            log::debug!("loaded override config from {}", path.display());
            layers.push(layer);
        }
    }
    Ok(ServerManagerConfig::fold(&layers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_soc_and_overrides_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(&dir, "base.json", r#"{"sessionServerPath": "/usr/bin/rialto"}"#);
        let soc = dir.path().join("soc.json");
        let config = load(&base, Some(&soc), None).unwrap();
        assert_eq!(config.session_server_path, "/usr/bin/rialto");
    }

    #[test]
    fn missing_base_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("missing.json");
        assert!(load(&base, None, None).is_err());
    }

    #[test]
    fn malformed_present_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(&dir, "base.json", r#"{"sessionServerPath": "/usr/bin/rialto"}"#);
        let overrides = write_file(&dir, "overrides.json", "not json");
        assert!(load(&base, None, Some(&overrides)).is_err());
    }

    #[test]
    fn three_layers_fold_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_file(
            &dir,
            "base.json",
            r#"{"sessionServerPath": "/usr/bin/base", "numOfPreloadedServers": 1}"#,
        );
        let soc = write_file(&dir, "soc.json", r#"{"numOfPreloadedServers": 2}"#);
        let overrides = write_file(
            &dir,
            "overrides.json",
            r#"{"sessionServerPath": "/usr/bin/override"}"#,
        );
        let config = load(&base, Some(&soc), Some(&overrides)).unwrap();
        assert_eq!(config.session_server_path, "/usr/bin/override");
        assert_eq!(config.num_of_preloaded_servers, 2);
    }
}
