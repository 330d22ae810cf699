use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::validate::{
    validate_dir_exist, validate_dir_exist_or_created, validate_weekday, validate_writable_dir,
};
use bon::Builder;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fs::read_dir;
use std::path::PathBuf;
use std::sync::Arc;
use validator::{Validate, ValidationError};

/// Top-level runner configuration, loaded once at startup and never mutated.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
pub struct RunnerConfig {
    #[validate(custom(function = validate_writable_dir))]
    pub lock_dir: Arc<std::path::Path>,
    #[validate(custom(function = validate_dir_exist_or_created))]
    pub archive_dir: Arc<std::path::Path>,
    #[serde(default = "default_tool")]
    pub tool: Arc<str>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[validate(custom(function = validate_sections))]
    pub sections: BTreeMap<Arc<str>, Arc<SectionConfig>>,
}

fn default_tool() -> Arc<str> {
    "duplicity".into()
}

fn default_workers() -> usize {
    4
}

fn validate_sections(
    sections: &BTreeMap<Arc<str>, Arc<SectionConfig>>,
) -> std::result::Result<(), ValidationError> {
    let problems = sections
        .iter()
        .filter_map(|(name, section)| section.validate().err().map(|e| format!("{name}: {e}")))
        .collect_vec();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("InvalidSection").with_message(problems.join("\n").into()))
    }
}

/// One backup section: a source tree, a target URL, and the scheduling and
/// retention parameters applied to it. Immutable once loaded.
///
/// With `multiple_dirs` set, each immediate subdirectory of `source` becomes
/// its own target with its own lock and its own target URL.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SectionConfig {
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    source: PathBuf,
    #[builder(into)]
    target: Arc<str>,
    /// Weeks between full backups; 0 forces a full on every invocation.
    #[validate(range(min = 0, max = 52))]
    full_interval: i64,
    /// Days between incremental backups.
    #[validate(range(min = 0, max = 30))]
    diff_interval: i64,
    #[validate(custom(function = validate_weekday))]
    #[builder(into)]
    full_bak_day: Arc<str>,
    /// Volume size in MB passed through to the tool.
    #[validate(range(min = 25, max = 2000))]
    volsize: u32,
    /// Number of full generations (plus dependent increments) to keep.
    #[validate(range(min = 1, max = 12))]
    retention: u32,
    #[serde(default)]
    #[builder(default)]
    multiple_dirs: bool,
    #[serde(default)]
    #[builder(default, into)]
    exclude: Vec<Arc<str>>,
    #[serde(default)]
    #[builder(into)]
    exclude_file: Option<PathBuf>,
    #[serde(default)]
    #[builder(into)]
    pre_command: Option<Arc<str>>,
    #[serde(default)]
    #[builder(into)]
    post_command: Option<Arc<str>>,
}

/// A resolved backup unit: the section source itself, or one of its
/// immediate subdirectories. Each target owns one lock key and one URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub section: Arc<str>,
    pub source: PathBuf,
    pub url: Arc<str>,
    pub lock_key: Arc<str>,
}

impl SectionConfig {
    pub fn resolve_targets(&self, name: &Arc<str>) -> Result<Vec<Target>> {
        if !self.multiple_dirs {
            return Ok(vec![Target {
                section: name.clone(),
                source: self.source.clone(),
                url: self.target.clone(),
                lock_key: name.clone(),
            }]);
        }

        let mut subdirs = read_dir(&self.source)
            .map_err(|e| {
                Error::section(
                    name.as_ref(),
                    format!("cannot enumerate subdirectories of {:?}: {}", self.source, e),
                )
            })?
            .filter_map(|r| r.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect_vec();
        subdirs.sort();

        Ok(subdirs
            .into_iter()
            .filter_map(|path| {
                let dir_name = path.file_name()?.to_str()?.to_owned();
                Some(Target {
                    section: name.clone(),
                    url: format!("{}/{}", self.target.trim_end_matches('/'), dir_name).into(),
                    lock_key: format!("{}_{}", name, dir_name).into(),
                    source: path,
                })
            })
            .collect())
    }
}
