use crate::comment::FileLevelPolicy;
use crate::diagnostic::InputFormat;
use crate::filter::FilterMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_FILE: &str = ".diffnote.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffnoteConfig {
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub bitbucket: BitbucketConfig,
}

/// [report] section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Tool name shown in comment bodies when the input doesn't carry one
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub format: InputFormat,
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub file_level: FileLevelPolicy,
    #[serde(default)]
    pub fail_on_error: bool,
}

/// [diff] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Shell command producing a unified diff; reporter default when unset
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_strip")]
    pub strip: usize,
}

/// [github] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Check run name used by the github-check reporter
    #[serde(default = "default_check_name")]
    pub check_name: String,
}

/// [gitlab] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitLabConfig {
    #[serde(default = "default_gitlab_api")]
    pub api_url: String,
}

/// [bitbucket] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitbucketConfig {
    #[serde(default = "default_bitbucket_api")]
    pub api_url: String,
    #[serde(default = "default_report_id")]
    pub report_id: String,
    #[serde(default = "default_report_title")]
    pub report_title: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    /// Base URL of a Bitbucket Server / Data Center instance
    #[serde(default)]
    pub server_url: Option<String>,
}

fn default_strip() -> usize {
    1
}

fn default_check_name() -> String {
    "diffnote".into()
}

fn default_gitlab_api() -> String {
    crate::backend::gitlab::DEFAULT_API_URL.into()
}

fn default_bitbucket_api() -> String {
    crate::backend::bitbucket::DEFAULT_API_URL.into()
}

fn default_report_id() -> String {
    crate::backend::bitbucket::DEFAULT_REPORT_ID.into()
}

fn default_report_title() -> String {
    "diffnote".into()
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            command: None,
            strip: default_strip(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            check_name: default_check_name(),
        }
    }
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            api_url: default_gitlab_api(),
        }
    }
}

impl Default for BitbucketConfig {
    fn default() -> Self {
        Self {
            api_url: default_bitbucket_api(),
            report_id: default_report_id(),
            report_title: default_report_title(),
            logo_url: None,
            server_url: None,
        }
    }
}

pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("diffnote/config.toml"))
}

/// Load config by merging global defaults with per-repo overrides.
/// Priority: per-repo `.diffnote.toml` (or `explicit`) > global
/// `<config_dir>/diffnote/config.toml` > built-in defaults.
/// Merging is deep: individual keys within a section override independently.
///
/// Missing files are fine; a file that exists but doesn't parse is an error.
pub fn load_config(repo_root: Option<&str>, explicit: Option<&Path>) -> Result<DiffnoteConfig> {
    let local_path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => repo_root.map(|root| Path::new(root).join(LOCAL_CONFIG_FILE)),
    };

    let global_table = match global_config_path() {
        Some(p) => read_table(&p)?,
        None => None,
    };
    let local_table = match &local_path {
        Some(p) => read_table(p)?,
        None => None,
    };
    if let (Some(p), None) = (explicit, &local_table) {
        anyhow::bail!("config file not found: {}", p.display());
    }

    merge_tables(global_table, local_table)
}

fn merge_tables(
    global: Option<toml::Table>,
    local: Option<toml::Table>,
) -> Result<DiffnoteConfig> {
    let merged = match (global, local) {
        (Some(mut global), Some(local)) => {
            deep_merge(&mut global, local);
            global
        }
        (Some(global), None) => global,
        (None, Some(local)) => local,
        (None, None) => return Ok(DiffnoteConfig::default()),
    };

    toml::Value::Table(merged)
        .try_into()
        .context("invalid diffnote configuration")
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let table = content
        .parse::<toml::Table>()
        .with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(Some(table))
}

/// Recursively merge `overlay` into `base`. Overlay values win; nested tables are merged recursively.
fn deep_merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                deep_merge(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
