//! TOML format types for module plan files.
//!
//! A plan directory holds one `<module>.toml` per module:
//!
//! ```toml
//! [module]
//! display_name = "Quicksort core"
//! dependencies = []
//!
//! [[jobs]]
//! name = "partition"
//! tasks = ["write partition()", "unit test partition()"]
//!
//! [[jobs]]
//! name = "sort"
//! prerequisites = ["job_1"]
//! tasks = ["write quicksort()"]
//! ```

use serde::{Deserialize, Serialize};

use super::model::{JobRecord, ModuleRecord, TaskRecord};

/// Top-level structure of a module plan file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleToml {
    #[serde(default)]
    pub module: ModuleMeta,
    /// Jobs in declared order; the first one is `job_1`.
    #[serde(default)]
    pub jobs: Vec<JobToml>,
}

/// Module-level metadata in `[module]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleMeta {
    /// Module name. Defaults to the file stem when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Module names this module depends on, or `["__ALL__"]`.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A single `[[jobs]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobToml {
    pub name: String,
    /// `job_N` or `module:job_N` references.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Task descriptions, executed in order.
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl ModuleToml {
    /// Convert into a parser record. `fallback_name` is used when the file
    /// does not name its module.
    pub fn into_record(self, fallback_name: &str, plan_file: Option<String>) -> ModuleRecord {
        let name = self
            .module
            .name
            .map(|n| n.trim().to_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_name.to_owned());
        ModuleRecord {
            name,
            display_name: self.module.display_name,
            plan_file,
            dependencies: self.module.dependencies,
            jobs: self
                .jobs
                .into_iter()
                .map(|j| JobRecord {
                    name: j.name,
                    prerequisites: j.prerequisites,
                    tasks: j.tasks.into_iter().map(TaskRecord::new).collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_module() {
        let toml_str = r#"
[[jobs]]
name = "only"
"#;
        let module: ModuleToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(module.module, ModuleMeta::default());
        assert_eq!(module.jobs.len(), 1);
        assert!(module.jobs[0].prerequisites.is_empty());
        assert!(module.jobs[0].tasks.is_empty());
    }

    #[test]
    fn deserialize_full_module() {
        let toml_str = r#"
[module]
name = "file_handler"
display_name = "File handling"
dependencies = ["quicksort_core"]

[[jobs]]
name = "read input"
tasks = ["open the file", "parse integers"]

[[jobs]]
name = "write output"
prerequisites = ["job_1", "quicksort_core:job_2"]
tasks = ["write sorted integers"]
"#;
        let module: ModuleToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(module.module.name.as_deref(), Some("file_handler"));
        assert_eq!(module.module.dependencies, vec!["quicksort_core"]);
        assert_eq!(
            module.jobs[1].prerequisites,
            vec!["job_1", "quicksort_core:job_2"]
        );
        assert_eq!(module.jobs[0].tasks.len(), 2);
    }

    #[test]
    fn into_record_falls_back_to_file_stem() {
        let module: ModuleToml = toml::from_str(
            r#"
[module]
name = "  "

[[jobs]]
name = "a"
tasks = ["t1"]
"#,
        )
        .expect("should parse");
        let record = module.into_record("cli", Some("cli.toml".to_owned()));
        assert_eq!(record.name, "cli");
        assert_eq!(record.plan_file.as_deref(), Some("cli.toml"));
        assert_eq!(record.jobs[0].tasks[0].description, "t1");
    }

    #[test]
    fn rejects_job_without_name() {
        let result: Result<ModuleToml, _> = toml::from_str(
            r#"
[[jobs]]
tasks = ["t"]
"#,
        );
        assert!(result.is_err());
    }
}
