use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use zli::completions::Shell;
use zli::DaemonKind;

#[derive(Parser)]
#[command(name = "zli")]
#[command(version)]
#[command(
    about = "Zero-trust access to databases, desktops, clusters and web apps",
    long_about = None
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Open a connection to a target through a local daemon
    Connect {
        /// Target name (e.g., prod-db, admin@prod-cluster)
        target: String,

        /// Kind of target
        #[arg(long = "type", short = 't', value_enum)]
        kind: DaemonKind,

        /// User to assume on the target (kube: cluster user)
        #[arg(long = "targetUser", alias = "target-user")]
        target_user: Option<String>,

        /// Kubernetes group to assume; repeatable
        #[arg(long = "targetGroup", alias = "target-group")]
        target_group: Vec<String>,

        /// Local port to listen on (default: previous port for this target, else any free port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Local address to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port for the daemon's control channel (db, rdp, sqlserver)
        #[arg(long = "controlPort", alias = "control-port")]
        control_port: Option<u16>,

        /// Run the daemon in the foreground with its output on this terminal
        #[arg(long)]
        debug: bool,
    },

    /// Show daemons started by zli
    #[command(name = "list-daemons", alias = "ld")]
    ListDaemons {
        /// Only show daemons of this kind
        #[arg(long = "targetType", alias = "target-type", value_enum, default_value = "all")]
        target_type: TargetTypeFilter,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop daemons and close their connections
    Disconnect {
        /// Connection to stop (all of `--type` if omitted)
        connection_id: Option<String>,

        /// Stop every daemon of every kind
        #[arg(long, conflicts_with_all = ["connection_id", "kind"])]
        all: bool,

        /// Only stop daemons of this kind
        #[arg(long = "type", short = 't', value_enum)]
        kind: Option<DaemonKind>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate client configuration
    Generate {
        #[command(subcommand)]
        command: GenerateCommands,
    },

    /// Stop every daemon and forget the session
    Logout,

    /// Generate or install shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Install into the shell's completion directory instead of printing
        #[arg(long)]
        install: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum GenerateCommands {
    /// Kubeconfig entries for running kube daemons
    #[command(name = "kubeConfig", alias = "kubeconfig")]
    KubeConfig {
        /// Merge into the kubeconfig at $KUBECONFIG or ~/.kube/config
        #[arg(short, long)]
        update: bool,

        /// Disconnect kube daemons and rotate the shared token
        #[arg(short, long)]
        force: bool,

        /// Write to this file instead
        #[arg(short, long = "outputFile", alias = "output-file")]
        output_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub(crate) enum TargetTypeFilter {
    All,
    Db,
    Rdp,
    SqlServer,
    Kube,
    Web,
}

impl TargetTypeFilter {
    pub fn kinds(self) -> Vec<DaemonKind> {
        match self {
            TargetTypeFilter::All => DaemonKind::ALL.to_vec(),
            TargetTypeFilter::Db => vec![DaemonKind::Db],
            TargetTypeFilter::Rdp => vec![DaemonKind::Rdp],
            TargetTypeFilter::SqlServer => vec![DaemonKind::SqlServer],
            TargetTypeFilter::Kube => vec![DaemonKind::Kube],
            TargetTypeFilter::Web => vec![DaemonKind::Web],
        }
    }
}
