//! `mason init`: write a default `mason.config.json` and create the data
//! directory.
//!
//! ```text
//! mason.config.json
//! .mason/
//! ├── mason.db         # backlog and execution runs
//! ├── checkpoints/     # review checkpoints (live + archived)
//! ├── cache/           # per-domain review cache
//! └── logs/            # daily rolling logs
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::mason_config::{CONFIG_FILE_NAME, MasonConfig, MasonConfigFile};

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    /// False when a config file already existed and was left alone.
    pub config_written: bool,
    /// True when the data directory was added to `.gitignore`.
    pub gitignore_updated: bool,
}

/// Initialize mason in `project_dir`. An existing config is kept unless `force`.
pub fn init_project(project_dir: &Path, force: bool) -> Result<InitResult> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);
    let config_written = force || !config_path.exists();

    let file = if config_written {
        let file = MasonConfigFile::default();
        file.save(&config_path)?;
        file
    } else {
        MasonConfigFile::load(&config_path)?
    };

    let config = MasonConfig::from_file(project_dir.to_path_buf(), file);
    config.ensure_directories()?;
    let gitignore_updated = ignore_data_dir(project_dir, &config.file.data_dir)?;

    Ok(InitResult {
        config_path,
        data_dir: config.data_dir,
        config_written,
        gitignore_updated,
    })
}

/// Whether `mason.config.json` exists.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(CONFIG_FILE_NAME).exists()
}

/// Append `<data_dir>/` to `.gitignore` unless an entry already covers it.
fn ignore_data_dir(project_dir: &Path, data_dir: &str) -> Result<bool> {
    let data_dir = data_dir.trim_end_matches('/');
    if data_dir.is_empty() || Path::new(data_dir).is_absolute() || data_dir.starts_with("..") {
        return Ok(false);
    }

    let path = project_dir.join(".gitignore");
    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).context("Failed to read .gitignore"),
    };

    let covered = existing.lines().map(str::trim).any(|line| {
        let line = line.trim_start_matches('/').trim_end_matches('/');
        line == data_dir
    });
    if covered {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("{data_dir}/\n"));
    std::fs::write(&path, content).context("Failed to update .gitignore")?;
    Ok(true)
}
