use anyhow::Result;
use zli::clienv;
use zli::kubeconfig::{write_document, KubeConfigDocument};
use zli::UserConfig;

use crate::output::icons;

/// Stop everything, strip managed kubeconfig entries, forget the session.
/// Teardown problems are logged and never stop the logout.
pub(crate) async fn cmd_logout() -> Result<()> {
    let mut config = UserConfig::load()?;

    match super::runtime(&config) {
        Ok(rt) => {
            let report = rt.disconnector().disconnect_everything().await;
            for (connection_id, e) in report.failures() {
                tracing::warn!(
                    connection_id,
                    error = %e,
                    "Daemon did not stop cleanly during logout"
                );
            }
            if report.stopped() > 0 {
                println!("{} Stopped {} daemon(s)", icons::SUCCESS, report.stopped());
            }
            let ids: Vec<String> = report.results.iter().map(|(id, _)| id.clone()).collect();
            match super::session_api(&config) {
                Ok(api) => super::close_connections(api.as_ref(), &ids).await,
                Err(e) => tracing::warn!(error = %e, "Skipping connection close"),
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not stop daemons during logout"),
    }

    if let Err(e) = remove_managed_kubeconfig_entries() {
        tracing::warn!(error = %e, "Could not clean up kubeconfig");
    }

    config.clear_session();
    config.save()?;
    println!("{} Logged out", icons::SUCCESS);
    Ok(())
}

fn remove_managed_kubeconfig_entries() -> zli::Result<()> {
    let path = clienv::kubeconfig_path();
    if !path.exists() {
        return Ok(());
    }
    let mut document = KubeConfigDocument::load(&path)?;
    let before = document.clone();
    document.merge(&[]);
    if document != before {
        write_document(&path, &document.to_yaml()?)?;
        tracing::info!(path = %path.display(), "Removed zli entries from kubeconfig");
    }
    Ok(())
}
