//! Loading and merging configuration from several files.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::config::{ConfigPath, GlobalConfig, MetricsConfig, interpolate, is_yaml_file};
use crate::error::ConfigError;

/// A config made of keyed components that may be split across files.
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global(&self) -> &GlobalConfig;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics(&self) -> &MetricsConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Move `other` into `self`. The same component key in two files is an error.
    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(ToString::to_string)
            .collect();
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        let incoming: Vec<_> = other.components_mut().drain(..).collect();
        self.components_mut().extend(incoming);
        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        Ok(())
    }
}

/// Load every path in order and merge the results.
///
/// All failures are collected before returning so a broken deployment shows
/// every bad file at once.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut files = Vec::new();
    let mut errors = Vec::new();

    for path in paths {
        match path {
            ConfigPath::File(file) => files.push(file.clone()),
            ConfigPath::Dir(dir) => match yaml_files_in(dir) {
                Ok(found) => files.extend(found),
                Err(e) => errors.push(format!("{}: {e}", dir.display())),
            },
        }
    }

    let mut config = C::default();
    for file in files {
        let result = load_file::<C>(&file).and_then(|partial| config.merge(partial));
        if let Err(e) = result {
            errors.push(format!("{}: {e}", file.display()));
        }
    }

    if errors.is_empty() {
        Ok(config)
    } else {
        Err(ConfigError::MultipleErrors { errors })
    }
}

fn yaml_files_in(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();
    Ok(files)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let contents =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;
    let interpolated = interpolate(&contents);
    if !interpolated.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: interpolated.errors.join("\n"),
        });
    }

    C::parse_yaml(&interpolated.text)
}
