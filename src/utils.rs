use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

/// Resolve a path found under a `*_path` config key against the directory
/// that contains the config file, leaving absolute paths untouched.
pub fn resolve_config_path(config_dir: &Path, value: &str) -> PathBuf {
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_dir.join(p)
    }
}

/// Checks to see if a directory is present, if not creates it (and any
/// missing parents).
pub fn check_or_create_dir(path: &Path) -> std::io::Result<()> {
    if !path.is_dir() {
        create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_path_joins_config_dir() {
        let dir = Path::new("/campaigns/run1");
        let resolved = resolve_config_path(dir, "predictors/registry.json");
        assert_eq!(resolved, PathBuf::from("/campaigns/run1/predictors/registry.json"));
    }

    #[test]
    fn resolve_absolute_path_is_untouched() {
        let dir = Path::new("/campaigns/run1");
        let resolved = resolve_config_path(dir, "/etc/anica/registry.json");
        assert_eq!(resolved, PathBuf::from("/etc/anica/registry.json"));
    }
}
