//! Config sources given on the command line.

use std::path::{Path, PathBuf};

use clap::Parser;

/// A single YAML file or a directory of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigPath {
    File(PathBuf),
    Dir(PathBuf),
}

impl ConfigPath {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Dir(path.into())
    }

    pub fn as_path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Dir(path) => path,
        }
    }
}

pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}

#[derive(Parser, Debug)]
#[command(version)]
pub struct CliArgs {
    /// Configuration file (repeatable)
    #[arg(short, long)]
    pub config: Vec<PathBuf>,

    /// Directory of configuration files (repeatable)
    #[arg(short = 'C', long = "config-dir")]
    pub config_dirs: Vec<PathBuf>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    pub validate: bool,
}

impl CliArgs {
    /// Files first, then directories, each group in the order given.
    pub fn config_paths(&self) -> Vec<ConfigPath> {
        self.config
            .iter()
            .map(ConfigPath::file)
            .chain(self.config_dirs.iter().map(ConfigPath::dir))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("ingest.yaml")));
        assert!(is_yaml_file(Path::new("conf.d/router.yml")));
        assert!(!is_yaml_file(Path::new("ingest.toml")));
        assert!(!is_yaml_file(Path::new("README")));
    }

    #[test]
    fn test_config_paths_order() {
        let args = CliArgs::parse_from([
            "freshet",
            "-C",
            "/etc/freshet.d",
            "-c",
            "a.yaml",
            "--config",
            "b.yaml",
        ]);
        assert_eq!(
            args.config_paths(),
            vec![
                ConfigPath::file("a.yaml"),
                ConfigPath::file("b.yaml"),
                ConfigPath::dir("/etc/freshet.d"),
            ]
        );
        assert!(!args.validate);
    }
}
