//! Completion scripts for the `zli` command tree.
//!
//! Installing only drops the script into zli's own data directory; the
//! user's rc files are never edited. The line that activates the script is
//! handed back so the CLI can print it.

use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::{generate, Generator};

pub use clap_complete::Shell;

use crate::error::{DaemonError, Result};

pub const BIN_NAME: &str = "zli";

/// A completion script written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCompletions {
    pub path: PathBuf,
    /// Line to add to the shell's startup file
    pub activation: String,
}

/// File name the shell expects, e.g. `_zli` for zsh.
pub fn completion_filename(shell: Shell) -> String {
    shell.file_name(BIN_NAME)
}

pub fn render_completions<C: CommandFactory>(shell: Shell) -> Vec<u8> {
    let mut cmd = C::command();
    let mut script = Vec::new();
    generate(shell, &mut cmd, BIN_NAME, &mut script);
    script
}

/// Write the script for `shell` into `dir`, replacing an older one.
pub fn install_completions<C: CommandFactory>(
    shell: Shell,
    dir: &Path,
) -> Result<InstalledCompletions> {
    let path = dir.join(completion_filename(shell));
    let write_failed = |source| DaemonError::ExternalFileWriteFailed {
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(write_failed)?;
    std::fs::write(&path, render_completions::<C>(shell)).map_err(write_failed)?;
    tracing::debug!(%shell, path = %path.display(), "Wrote completion script");

    let activation = activation_line(shell, dir, &path);
    Ok(InstalledCompletions { path, activation })
}

fn activation_line(shell: Shell, dir: &Path, path: &Path) -> String {
    match shell {
        Shell::Zsh => format!(
            "fpath=(\"{}\" $fpath); autoload -Uz compinit && compinit",
            dir.display()
        ),
        Shell::PowerShell => format!(". \"{}\"", path.display()),
        Shell::Elvish => format!("eval (slurp < \"{}\")", path.display()),
        _ => format!("source \"{}\"", path.display()),
    }
}
