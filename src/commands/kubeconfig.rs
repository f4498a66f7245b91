use anyhow::{Context, Result};
use std::path::PathBuf;
use zli::clienv;
use zli::kubeconfig::{GenerateOptions, KubeConfigOutput, KubeConfigReconciler};
use zli::UserConfig;

use crate::output::{self, icons};

pub(crate) async fn cmd_generate_kubeconfig(
    update: bool,
    force: bool,
    output_file: Option<PathBuf>,
) -> Result<()> {
    let mut config = UserConfig::load()?;
    let rt = super::runtime(&config)?;
    let default_path = clienv::kubeconfig_path();

    let output = match output_file {
        Some(path) => KubeConfigOutput::File(path),
        None if update => KubeConfigOutput::InPlace(default_path.clone()),
        None => KubeConfigOutput::Return,
    };
    let options = GenerateOptions {
        update,
        force,
        output,
    };

    let email = config.email().to_string();
    let result = KubeConfigReconciler::new(rt, default_path)
        .generate(&mut config.kube, &email, &options)
        .await?;

    if result.token_rotated {
        config
            .save()
            .context("Failed to store the rotated kube token")?;
    }

    if let Some(report) = &result.disconnected {
        for (connection_id, e) in report.failures() {
            eprintln!(
                "{} Kube daemon {} did not stop cleanly: {}",
                icons::WARNING,
                connection_id,
                e
            );
        }
        eprintln!(
            "{} Disconnected {} kube daemon(s); reconnect with `zli connect`",
            icons::INFO,
            report.results.len()
        );
    }
    if result.pruned > 0 {
        eprintln!(
            "{} Dropped {} kube daemon(s) that had quit unexpectedly",
            icons::WARNING,
            result.pruned
        );
    }

    match &result.written_to {
        Some(path) => println!(
            "{} Wrote {} cluster(s) to {}",
            icons::SUCCESS,
            result
                .document
                .cluster_names()
                .iter()
                .filter(|name| zli::kubeconfig::is_managed(name))
                .count(),
            output::bold(path.display())
        ),
        None => print!("{}", result.yaml),
    }
    Ok(())
}
