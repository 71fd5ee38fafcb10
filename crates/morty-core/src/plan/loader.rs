//! Loading a plan directory from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::graph::{GraphError, GraphOptions, PlanGraph, build_graph};
use super::model::ModuleRecord;
use super::toml_format::ModuleToml;

/// Errors that can occur while reading a plan directory.
#[derive(Debug, Error)]
pub enum PlanLoadError {
    #[error("failed to read plan directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no module plan files (*.toml) found in {}", .0.display())]
    Empty(PathBuf),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Read every `*.toml` module file in `dir` into parser records.
///
/// Files are read in file-name order. Files whose name starts with `README`
/// are skipped. The module name defaults to the file stem.
pub fn read_plan_dir(dir: &Path) -> Result<Vec<ModuleRecord>, PlanLoadError> {
    let io_err = |source| PlanLoadError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_module_file(path))
        .collect();
    files.sort();

    let mut records = Vec::with_capacity(files.len());
    for path in files {
        let content = fs::read_to_string(&path).map_err(|source| PlanLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let parsed: ModuleToml =
            toml::from_str(&content).map_err(|source| PlanLoadError::Toml {
                path: path.clone(),
                source,
            })?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(str::to_owned);
        records.push(parsed.into_record(&stem, file_name));
    }

    if records.is_empty() {
        return Err(PlanLoadError::Empty(dir.to_path_buf()));
    }
    Ok(records)
}

/// Read and validate a plan directory.
pub fn load_plan_dir(dir: &Path, options: &GraphOptions) -> Result<PlanGraph, PlanLoadError> {
    let records = read_plan_dir(dir)?;
    let graph = build_graph(records, options)?;
    tracing::debug!(
        dir = %dir.display(),
        modules = graph.modules().len(),
        jobs = graph.total_jobs(),
        "loaded plan"
    );
    Ok(graph)
}

fn is_module_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let is_readme = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_uppercase().starts_with("README"));
    is_toml && !is_readme
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn loads_modules_in_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.toml", "[[jobs]]\nname = \"b1\"\n");
        write(dir.path(), "a.toml", "[[jobs]]\nname = \"a1\"\n");
        write(dir.path(), "README.toml", "not = [valid");
        write(dir.path(), "notes.md", "# ignored");

        let records = read_plan_dir(dir.path()).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(records[0].plan_file.as_deref(), Some("a.toml"));
    }

    #[test]
    fn reports_file_with_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.toml", "[[jobs]\nname =");
        let err = read_plan_dir(dir.path()).unwrap_err();
        match err {
            PlanLoadError::Toml { path, .. } => assert!(path.ends_with("broken.toml")),
            other => panic!("expected Toml error, got: {other}"),
        }
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_plan_dir(dir.path()).unwrap_err();
        assert!(matches!(err, PlanLoadError::Empty(_)), "got: {err}");
    }

    #[test]
    fn load_plan_dir_validates_graph() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.toml",
            "[[jobs]]\nname = \"a1\"\nprerequisites = [\"job_2\"]\n",
        );
        let err = load_plan_dir(dir.path(), &GraphOptions::permissive()).unwrap_err();
        assert!(
            matches!(err, PlanLoadError::Graph(GraphError::UnknownPrerequisite { .. })),
            "got: {err}"
        );
    }
}
