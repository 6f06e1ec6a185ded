//! Standard paths used by the trust daemons

use std::path::PathBuf;

/// Standard trustd paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.local/share/trustd)
    pub data: PathBuf,
    /// Config directory (~/.config/trustd)
    pub config: PathBuf,
    /// Runtime directory ($XDG_RUNTIME_DIR/trustd, falling back to the data dir)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("trustd");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("trustd");

        let runtime = dirs::runtime_dir()
            .map(|dir| dir.join("trustd"))
            .unwrap_or_else(|| data.clone());

        Self {
            data,
            config,
            runtime,
        }
    }

    /// Everything below one root directory
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join("data"),
            config: root.join("config"),
            runtime: root.join("run"),
        }
    }

    /// Default config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }

    /// Default local-socket endpoint the stub of a service listens on
    pub fn endpoint(&self, service: &str) -> PathBuf {
        self.runtime.join(format!("{}.sock", file_stem(service)))
    }

    /// Default trust store database for a service
    pub fn store(&self, service: &str) -> PathBuf {
        self.data.join("stores").join(format!("{}.db", file_stem(service)))
    }
}

/// Map a service name onto something safe to use as a file name.
pub fn file_stem(service: &str) -> String {
    let stem: String = service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match stem.trim_start_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("camera"), "camera");
        assert_eq!(file_stem("com.example/app"), "com.example_app");
        assert_eq!(file_stem("../etc"), "_etc");
        assert_eq!(file_stem(""), "_");
    }

    #[test]
    fn test_rooted_layout() {
        let paths = Paths::under("/tmp/trustd-test");
        assert_eq!(
            paths.endpoint("camera"),
            PathBuf::from("/tmp/trustd-test/run/camera.sock")
        );
        assert_eq!(
            paths.store("camera"),
            PathBuf::from("/tmp/trustd-test/data/stores/camera.db")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/tmp/trustd-test/config/config.yaml")
        );
    }
}
