use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

mod commands;

use commands::Host;

#[derive(Parser)]
#[command(name = "kata", version, about = "kata: git push deployments for a single host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List apps (`*` marks apps with a generated descriptor)
    Apps,

    /// Deploy the current checkout of an app
    Deploy { app: String },

    /// Restart an app, recreating it if its descriptor changed
    Restart { app: String },

    /// Stop an app's containers
    Stop { app: String },

    /// Show an app's logs
    Logs {
        app: String,
        /// Only this service
        service: Option<String>,
        /// Lines to show from the end of each log
        #[arg(short = 'n', long)]
        tail: Option<usize>,
        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,
    },

    /// Show an app's containers, or its tasks on a cluster
    Ps { app: String },

    /// Run a command inside a running service container
    Run {
        app: String,
        /// Service to run in; defaults to the manifest's first service
        #[arg(short, long)]
        service: Option<String>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Remove an app
    Rm {
        app: String,
        /// Also remove the app's data and config directories
        #[arg(long)]
        wipe: bool,
    },

    /// Show an app's override environment
    Config { app: String },

    /// Print one override variable
    #[command(name = "config:get")]
    ConfigGet { app: String, key: String },

    /// Set override variables (KEY=VALUE ...)
    #[command(name = "config:set")]
    ConfigSet {
        app: String,
        #[arg(required = true)]
        assignments: Vec<String>,
    },

    /// Remove override variables
    #[command(name = "config:unset")]
    ConfigUnset {
        app: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show the environment of the last successful deploy
    #[command(name = "config:live")]
    ConfigLive { app: String },

    /// Show an app's manifest
    Manifest { app: String },

    /// Show an app's generated descriptor
    Descriptor { app: String },

    /// Show an app's live routing section
    Routing { app: String },

    /// Show an app's deployment mode
    Mode { app: String },

    /// Change an app's deployment mode (single-host or clustered)
    #[command(name = "mode:set")]
    ModeSet { app: String, mode: String },

    /// List an app's secrets
    #[command(name = "secrets:list")]
    SecretsList { app: String },

    /// Create or replace a secret; the value is read from stdin when omitted
    #[command(name = "secrets:set")]
    SecretsSet {
        app: String,
        name: String,
        value: Option<String>,
    },

    /// Remove a secret
    #[command(name = "secrets:rm")]
    SecretsRm { app: String, name: String },

    /// Create the host directory layout
    Setup,

    /// Post-receive hook entry point
    #[command(name = "git-hook", hide = true)]
    GitHook { app: String },

    /// Accept a push, creating the app's repository on first use
    #[command(name = "git-receive-pack", hide = true)]
    GitReceivePack { app: String },

    /// Serve a fetch from the app's repository
    #[command(name = "git-upload-pack", hide = true)]
    GitUploadPack { app: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output; logs go to stderr.
    fmt()
        .with_env_filter(EnvFilter::try_from_env("KATA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let host = Host::load()?;

    match cli.command {
        Command::Apps => host.apps(),
        Command::Deploy { app } => host.deploy(&app).await,
        Command::Restart { app } => host.restart(&app).await,
        Command::Stop { app } => host.stop(&app).await,
        Command::Logs {
            app,
            service,
            tail,
            follow,
        } => host.logs(&app, service.as_deref(), tail, follow).await,
        Command::Ps { app } => host.ps(&app).await,
        Command::Run {
            app,
            service,
            command,
        } => host.run(&app, service.as_deref(), &command).await,
        Command::Rm { app, wipe } => host.remove(&app, wipe).await,
        Command::Config { app } => host.config(&app),
        Command::ConfigGet { app, key } => host.config_get(&app, &key),
        Command::ConfigSet { app, assignments } => host.config_set(&app, &assignments),
        Command::ConfigUnset { app, keys } => host.config_unset(&app, &keys),
        Command::ConfigLive { app } => host.config_live(&app),
        Command::Manifest { app } => host.manifest(&app),
        Command::Descriptor { app } => host.descriptor(&app),
        Command::Routing { app } => host.routing(&app).await,
        Command::Mode { app } => host.mode(&app),
        Command::ModeSet { app, mode } => host.set_mode(&app, &mode).await,
        Command::SecretsList { app } => host.secrets_list(&app).await,
        Command::SecretsSet { app, name, value } => host.secrets_set(&app, &name, value).await,
        Command::SecretsRm { app, name } => host.secrets_remove(&app, &name).await,
        Command::Setup => host.setup(),
        Command::GitHook { app } => host.git_hook(&app).await,
        Command::GitReceivePack { app } => host.git_shell("git-receive-pack", &app).await,
        Command::GitUploadPack { app } => host.git_shell("git-upload-pack", &app).await,
    }
}
