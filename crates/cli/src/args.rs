use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "tapline", version, about = "Deploy and expose the tapline traffic-observability platform")]
pub struct Cli {
    /// Path to a kubeconfig file (default: $KUBECONFIG, then ~/.kube/config)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Override a config value, e.g. --set tap.proxy.front_port=9000
    #[arg(long = "set", value_name = "KEY.PATH=VALUE", global = true, action = ArgAction::Append)]
    pub set: Vec<String>,

    /// Local host the platform is exposed on
    #[arg(long, global = true)]
    pub proxy_host: Option<String>,

    /// Local port for the front
    #[arg(long, global = true)]
    pub front_port: Option<u16>,

    /// Local port for the hub
    #[arg(long, global = true)]
    pub hub_port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SelfNamespace {
    /// Namespace the platform is installed in
    #[arg(short = 's', long = "self-namespace")]
    pub self_namespace: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ServiceArg {
    Front,
    Hub,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the platform, target matching pods and expose the front
    Start {
        /// Regex selecting the pods to capture (default: config tap.regex)
        regex: Option<String>,
        /// Namespaces to target; repeatable
        #[arg(short = 'n', long = "namespace", action = ArgAction::Append)]
        namespaces: Vec<String>,
        /// Target every namespace
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
        #[command(flatten)]
        ns: SelfNamespace,
        /// Preview matching pods and stop
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Do not open a browser
        #[arg(long, action = ArgAction::SetTrue)]
        headless: bool,
    },
    /// Uninstall the platform
    Stop {
        #[command(flatten)]
        ns: SelfNamespace,
    },
    /// Expose a running platform service locally until interrupted
    Expose {
        #[arg(long, value_enum, default_value_t = ServiceArg::Front)]
        service: ServiceArg,
        #[command(flatten)]
        ns: SelfNamespace,
    },
    /// Expose the front and open it in a browser
    Open {
        #[command(flatten)]
        ns: SelfNamespace,
    },
    /// Diagnose cluster access, permissions and platform reachability
    Check {
        #[command(flatten)]
        ns: SelfNamespace,
    },
    /// Serve MCP tools as JSON-RPC over stdin/stdout
    StdioBridge {
        /// Use this tool endpoint instead of the cluster
        #[arg(long)]
        url: Option<String>,
        /// Offer start_platform and stop_platform
        #[arg(long, action = ArgAction::SetTrue)]
        allow_destructive: bool,
        #[command(flatten)]
        ns: SelfNamespace,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to the config file
        #[arg(long, action = ArgAction::SetTrue)]
        regenerate: bool,
    },
    /// Print the version
    Version,
}

impl Command {
    /// Commands whose stdout belongs to a protocol stream.
    pub fn quiet_logs(&self) -> bool {
        matches!(self, Command::StdioBridge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_collects_repeated_namespaces() {
        let cli = Cli::parse_from(["tapline", "--set", "tap.headless=true", "start", "^api", "-n", "shop", "-n", "billing", "-s", "obs"]);
        match cli.command {
            Command::Start { regex, namespaces, ns, .. } => {
                assert_eq!(regex.as_deref(), Some("^api"));
                assert_eq!(namespaces, vec!["shop", "billing"]);
                assert_eq!(ns.self_namespace.as_deref(), Some("obs"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cli.set, vec!["tap.headless=true"]);
    }

    #[test]
    fn global_flags_follow_the_verb() {
        let cli = Cli::parse_from(["tapline", "expose", "--service", "hub", "--hub-port", "9898", "--context", "kind"]);
        assert_eq!(cli.hub_port, Some(9898));
        assert_eq!(cli.context.as_deref(), Some("kind"));
        assert!(matches!(cli.command, Command::Expose { service: ServiceArg::Hub, .. }));
    }

    #[test]
    fn bad_flags_are_usage_errors() {
        let err = Cli::try_parse_from(["tapline", "start", "--front-port", "nope"]).expect_err("invalid port");
        assert_eq!(err.exit_code(), 2);
    }
}
