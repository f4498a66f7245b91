use anyhow::Result;
use serde::Serialize;
use zli::daemon::ResolvedDaemon;
use zli::{DaemonKind, DaemonStatus, UserConfig};

use crate::output::{self, icons, Table};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DaemonRow<'a> {
    #[serde(rename = "type")]
    kind: DaemonKind,
    connection_id: &'a str,
    name: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_user: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    target_groups: Vec<String>,
}

impl<'a> DaemonRow<'a> {
    fn new(resolved: &'a ResolvedDaemon) -> Self {
        let config = resolved.status.config();
        let live = match &resolved.status {
            DaemonStatus::DaemonIsRunning { details, .. } => Some(details),
            _ => None,
        };
        Self {
            kind: resolved.kind,
            connection_id: &resolved.connection_id,
            name: config.map(|c| c.name.as_str()).unwrap_or_default(),
            status: resolved.status.as_str(),
            local_url: live.map(|d| d.local_url.clone()),
            target: config.map(|c| c.target.target_name()),
            target_user: config.and_then(|c| c.target.target_user()),
            target_groups: config
                .map(|c| c.target.target_groups().to_vec())
                .unwrap_or_default(),
        }
    }
}

pub(crate) async fn cmd_list_daemons(kinds: &[DaemonKind], json: bool) -> Result<()> {
    let config = UserConfig::load()?;
    let rt = super::runtime(&config)?;

    let resolved = rt.resolver().resolve_kinds(kinds).await?;
    let rows: Vec<DaemonRow> = resolved.iter().map(DaemonRow::new).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("{} No daemons running", icons::INFO);
    } else {
        let mut table = Table::new().header([
            "Type",
            "Connection",
            "Target",
            "User",
            "Local URL",
            "Status",
        ]);
        for row in &rows {
            let status = match row.status {
                "running" => output::success(row.status).to_string(),
                other => output::warning(other).to_string(),
            };
            table = table.row([
                row.kind.to_string(),
                row.connection_id.to_string(),
                row.target.unwrap_or("-").to_string(),
                row.target_user.unwrap_or("-").to_string(),
                row.local_url.clone().unwrap_or_else(|| "-".to_string()),
                status,
            ]);
        }
        table.print();
    }

    let stale: Vec<&ResolvedDaemon> = resolved
        .iter()
        .filter(|r| matches!(r.status, DaemonStatus::DaemonQuitUnexpectedly { .. }))
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    for entry in &stale {
        // stderr keeps --json output parseable
        eprintln!(
            "{} {} daemon for {} quit unexpectedly; removing it",
            icons::WARNING,
            entry.kind.label(),
            output::bold(&entry.connection_id)
        );
    }
    let pruned = rt.disconnector().prune(&resolved).await;
    tracing::info!(pruned, "Removed stale daemon entries");

    let ids: Vec<String> = stale.iter().map(|r| r.connection_id.clone()).collect();
    super::close_connections(super::session_api(&config)?.as_ref(), &ids).await;
    Ok(())
}
