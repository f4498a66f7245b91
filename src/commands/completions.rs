use std::io::Write;

use anyhow::Result;
use zli::clienv;
use zli::completions::{install_completions, render_completions, Shell};

use crate::args::Cli;
use crate::output::{self, icons};

pub(crate) fn cmd_completions(shell: Shell, install: bool) -> Result<()> {
    if !install {
        std::io::stdout().write_all(&render_completions::<Cli>(shell))?;
        return Ok(());
    }

    let installed = install_completions::<Cli>(shell, &clienv::completions_dir())?;
    println!(
        "{} Installed {} completions to {}",
        icons::SUCCESS,
        shell,
        output::bold(installed.path.display())
    );
    println!("  {} Add this line to your shell startup file:", icons::INFO);
    println!("    {}", output::muted(&installed.activation));
    Ok(())
}
