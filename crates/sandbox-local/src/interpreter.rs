use std::path::{Path, PathBuf};

use sandbox::{Result, SandboxError};

/// Resolve the interpreter binary for a runtime version.
///
/// An explicit override wins. Otherwise `python<version>` is looked up on
/// `PATH`, falling back to `python3` for 3.x versions.
pub fn resolve_interpreter(override_path: Option<&Path>, runtime_version: &str) -> Result<PathBuf> {
    validate_version(runtime_version)?;

    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }

    let mut candidates = vec![format!("python{runtime_version}")];
    if runtime_version.split('.').next() == Some("3") {
        candidates.push("python3".to_string());
    }

    for name in &candidates {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    Err(SandboxError::BackendNotAvailable(format!(
        "no interpreter for runtime {runtime_version} (tried {})",
        candidates.join(", ")
    )))
}

fn validate_version(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && version.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())
        });
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfig(format!(
            "invalid runtime version: {version:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_is_used_as_is() {
        let path = resolve_interpreter(Some(Path::new("/bin/sh")), "3.11").unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn rejects_malformed_versions() {
        for bad in ["", "3.", "3..1", "3.11; rm -rf /", "latest"] {
            let err = resolve_interpreter(Some(Path::new("/bin/sh")), bad).unwrap_err();
            assert!(matches!(err, SandboxError::InvalidConfig(_)), "{bad:?}");
        }
    }

    #[test]
    fn unknown_runtime_is_backend_not_available() {
        let err = resolve_interpreter(None, "99.99").unwrap_err();
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)));
    }
}
