use anyhow::{bail, Context, Result};
use zli::api::CreateConnectionRequest;
use zli::daemon::{ConnectionCredentials, LaunchRequest, LauncherSettings};
use zli::{DaemonKind, UserConfig};

use crate::output::{self, icons};

pub(crate) struct ConnectArgs {
    pub target: String,
    pub kind: DaemonKind,
    pub target_user: Option<String>,
    pub target_groups: Vec<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub control_port: Option<u16>,
    pub debug: bool,
}

pub(crate) async fn cmd_connect(args: ConnectArgs) -> Result<()> {
    let mut config = UserConfig::load()?;
    let Some(api) = super::session_api(&config)? else {
        bail!("Not logged in. Log in to BastionZero before connecting");
    };

    if args.kind == DaemonKind::Kube && args.target_user.is_none() {
        bail!("--targetUser is required for kube targets");
    }
    let target_groups = if args.target_groups.is_empty() && args.kind == DaemonKind::Kube {
        config.kube.default_target_groups.clone()
    } else {
        args.target_groups.clone()
    };

    let grant = api
        .create_connection(
            args.kind,
            &CreateConnectionRequest {
                target_name: args.target.clone(),
                target_user: args.target_user.clone(),
                target_groups: target_groups.clone(),
            },
        )
        .await
        .with_context(|| {
            format!("Failed to create a {} connection to {}", args.kind, args.target)
        })?;
    tracing::info!(connection_id = %grant.connection_id, kind = %args.kind, "Connection created");

    if args.kind == DaemonKind::Kube && config.kube.ensure_token() {
        config.save()?;
    }

    let request = LaunchRequest {
        connection_id: grant.connection_id.clone(),
        display_name: args.target.clone(),
        target: grant.target_details(args.kind, args.target_user.clone(), target_groups),
        local_host: args
            .host
            .clone()
            .or_else(|| Some(config.daemon.default_local_host.clone())),
        local_port: args.port,
        control_port: args.control_port,
        credentials: ConnectionCredentials {
            connection_service_url: grant.connection_service_url.clone(),
            connection_auth_token: grant.connection_auth_token.clone(),
            session_id: config.session_id.clone().unwrap_or_default(),
            session_token: config.session_token.clone().unwrap_or_default(),
            agent_pub_key: grant.agent_pub_key.clone(),
            localhost_token: (args.kind == DaemonKind::Kube).then(|| config.kube.token.clone()),
            cert_path: config.kube.cert_path.clone(),
            key_path: config.kube.key_path.clone(),
        },
    };

    let settings = LauncherSettings {
        startup_timeout: config.daemon.startup_timeout(),
        poll_interval: config.daemon.poll_interval(),
        ..LauncherSettings::new(config.daemon_path(), UserConfig::config_path())
    };
    let launcher = super::runtime(&config)?.launcher(settings);

    if args.debug {
        println!(
            "{} Running {} daemon in the foreground (Ctrl+C to stop)",
            icons::INFO,
            args.kind
        );
        let status = launcher.launch_attached(&request).await;
        super::close_connections(Some(&api), &[grant.connection_id.clone()]).await;
        let status = status?;
        if !status.success() {
            bail!("Daemon exited with {}", status);
        }
        return Ok(());
    }

    let pb = super::create_progress_bar(&format!(
        "Starting {} daemon for {}...",
        args.kind, args.target
    ));
    let launched = launcher.launch(&request).await;
    pb.finish_and_clear();

    let daemon = match launched {
        Ok(daemon) => daemon,
        Err(e) => {
            super::close_connections(Some(&api), &[grant.connection_id.clone()]).await;
            let log = launcher.settings().log_path(args.kind, &grant.connection_id);
            println!("  {} Daemon log: {}", icons::INFO, output::muted(log.display()));
            return Err(e.into());
        }
    };

    println!(
        "{} Started {} daemon for {} at {}",
        icons::SUCCESS,
        args.kind.label(),
        output::bold(&args.target),
        output::success(daemon.local_url())
    );
    match args.kind {
        DaemonKind::Kube => println!(
            "  {} Run `zli generate kubeConfig --update` to point kubectl at it",
            icons::INFO
        ),
        DaemonKind::Web => println!(
            "  {} Open http://{} in your browser",
            icons::INFO,
            daemon.local_url()
        ),
        _ => {}
    }
    println!(
        "  {} Connection id: {}",
        icons::INFO,
        output::muted(&grant.connection_id)
    );
    Ok(())
}
