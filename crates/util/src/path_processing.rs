use std::{env, path::PathBuf};

use dirs_next::{config_dir, home_dir};

/// Name of the per-user directory holding engine config and stored runs.
pub const CHAINFURY_DIR_NAME: &str = "chainfury";

/// Expand a leading `~` to the home directory. Other paths are returned trimmed.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    if trimmed == "~" {
        return home();
    }
    match trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        Some(rest) => home().join(rest),
        None => PathBuf::from(trimmed),
    }
}

/// `<config_dir>/chainfury`, or `./chainfury` when the platform has no config directory.
pub fn chainfury_config_dir() -> PathBuf {
    config_dir().unwrap_or_else(|| PathBuf::from(".")).join(CHAINFURY_DIR_NAME)
}

/// Path named by an environment variable, tilde-expanded. Unset or blank values yield `None`.
pub fn path_from_env(variable: &str) -> Option<PathBuf> {
    env::var(variable)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| expand_tilde(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_home_prefixes() {
        let Some(home) = home_dir() else { return };
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde(" ~/chains/a.yaml "), home.join("chains/a.yaml"));
        assert_eq!(expand_tilde("/tmp/runs.json"), PathBuf::from("/tmp/runs.json"));
        assert_eq!(expand_tilde("relative/~/path"), PathBuf::from("relative/~/path"));
    }

    #[test]
    fn env_paths_ignore_blank_values() {
        temp_env::with_var("CHAINFURY_TEST_PATH", Some("   "), || {
            assert_eq!(path_from_env("CHAINFURY_TEST_PATH"), None);
        });
        temp_env::with_var("CHAINFURY_TEST_PATH", Some("/var/lib/chainfury/runs.json"), || {
            assert_eq!(
                path_from_env("CHAINFURY_TEST_PATH"),
                Some(PathBuf::from("/var/lib/chainfury/runs.json"))
            );
        });
        temp_env::with_var_unset("CHAINFURY_TEST_PATH", || {
            assert_eq!(path_from_env("CHAINFURY_TEST_PATH"), None);
        });
    }

    #[test]
    fn config_dir_ends_with_project_name() {
        assert!(chainfury_config_dir().ends_with(CHAINFURY_DIR_NAME));
    }
}
