use directories::ProjectDirs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "streamd.conf";
const SYSTEM_CONFIG_PATH: &str = "/etc/streamd/streamd.conf";

/// Default node config location: `<config_dir>/streamd.conf` for the current
/// user, or `/etc/streamd/streamd.conf` when no home directory is known.
#[must_use]
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "streamd").map_or_else(
        || PathBuf::from(SYSTEM_CONFIG_PATH),
        |project| project.config_dir().join(CONFIG_FILE_NAME),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path_file_name() {
        assert!(default_config_path().ends_with(CONFIG_FILE_NAME));
    }
}
