use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use zli::daemon::{DisconnectOutcome, DisconnectReport};
use zli::{DaemonKind, UserConfig};

use crate::output::{self, icons};

/// `--all` is the same as giving neither a connection id nor `--type`, so
/// only `kind` narrows the batch.
pub(crate) async fn cmd_disconnect(
    connection_id: Option<String>,
    kind: Option<DaemonKind>,
    yes: bool,
) -> Result<()> {
    let config = UserConfig::load()?;
    let rt = super::runtime(&config)?;
    let disconnector = rt.disconnector();
    let api = super::session_api(&config)?;

    if let Some(connection_id) = connection_id {
        let outcomes = match kind {
            Some(kind) => vec![(kind, disconnector.disconnect(kind, &connection_id).await?)],
            None => disconnector.disconnect_any(&connection_id).await?,
        };
        if outcomes.iter().all(|(_, o)| *o == DisconnectOutcome::NotRunning) {
            println!(
                "{} No daemon running for {}",
                icons::INFO,
                output::bold(&connection_id)
            );
            return Ok(());
        }
        for (kind, outcome) in &outcomes {
            print_outcome(*kind, &connection_id, outcome);
        }
        super::close_connections(api.as_ref(), &[connection_id]).await;
        return Ok(());
    }

    let kinds: Vec<DaemonKind> = match kind {
        Some(kind) => vec![kind],
        None => DaemonKind::ALL.to_vec(),
    };

    let running: usize = kinds
        .iter()
        .map(|kind| rt.registry.get(*kind).map(|m| m.len()))
        .sum::<zli::Result<usize>>()?;
    if running == 0 {
        println!("{} No daemons to disconnect", icons::INFO);
        return Ok(());
    }

    if !yes && std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Disconnect {} daemon(s)?", running))
            .default(true)
            .interact()?;
        if !confirmed {
            println!("{} Cancelled", icons::INFO);
            return Ok(());
        }
    }

    let mut report = DisconnectReport::default();
    for kind in kinds {
        let batch = disconnector.disconnect_all(kind).await?;
        for (connection_id, result) in batch.results {
            match &result {
                Ok(outcome) => print_outcome(kind, &connection_id, outcome),
                Err(e) => println!(
                    "{} Failed to stop {} daemon {}: {}",
                    icons::ERROR,
                    kind,
                    output::bold(&connection_id),
                    output::error(e)
                ),
            }
            report.results.push((connection_id, result));
        }
    }

    let ids: Vec<String> = report.results.iter().map(|(id, _)| id.clone()).collect();
    super::close_connections(api.as_ref(), &ids).await;

    let failed = report.failures().count();
    if failed > 0 {
        bail!(
            "{} of {} daemon(s) could not be stopped cleanly",
            failed,
            report.results.len()
        );
    }
    Ok(())
}

fn print_outcome(kind: DaemonKind, connection_id: &str, outcome: &DisconnectOutcome) {
    match outcome {
        DisconnectOutcome::NotRunning => {}
        DisconnectOutcome::Stopped { graceful } => println!(
            "{} Stopped {} daemon {}{}",
            icons::SUCCESS,
            kind.label(),
            output::bold(connection_id),
            if *graceful { "" } else { " (terminated)" }
        ),
        DisconnectOutcome::Stale { .. } => println!(
            "{} Removed {} daemon {} {}",
            icons::WARNING,
            kind.label(),
            output::bold(connection_id),
            output::muted("(it had already quit)")
        ),
    }
}
