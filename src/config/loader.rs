// src/config/loader.rs

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Read and deserialize a config file without validating it.
///
/// The I/O error carries the offending path so a missing `--config` is
/// obvious from the message alone.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), bytes = contents.len(), "read config file");
    parse_str(&contents)
}

/// Deserialize config text. Defaults come from the `serde` attributes on
/// the raw model.
pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Load, deserialize and validate. References, regexes, durations and limits
/// all have to check out.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HpctestError;

    #[test]
    fn missing_file_names_the_path() {
        let err = load_from_path("/definitely/not/here/hpctest.toml").unwrap_err();
        match err {
            HpctestError::IoError(e) => {
                assert_eq!(e.kind(), io::ErrorKind::NotFound);
                assert!(e.to_string().contains("/definitely/not/here/hpctest.toml"), "{e}");
            }
            other => panic!("expected IoError, got {other:?}"),
        }
    }

    #[test]
    fn parse_str_rejects_malformed_toml() {
        assert!(matches!(parse_str("[config\nmax_jobs = 1"), Err(HpctestError::TomlError(_))));
    }
}
