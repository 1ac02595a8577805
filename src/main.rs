use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ocvpn::menu::Menu;
use ocvpn::platform::{self, unix::SystemProcessControl};
use ocvpn::prompt::{TerminalPrompter, acquire_config, acquire_credentials};
use ocvpn::session::{SYSTEM_STATE_DIR, SessionPaths, SessionSettings};
use ocvpn::{ConfigPatch, ConfigStore, SessionError, SessionManager, SessionReport};

#[derive(Parser)]
#[command(name = "ocvpn")]
#[command(about = "Start, stop and track an openconnect (AnyConnect) VPN session")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/ocvpn/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for the session marker and lock
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Run openconnect through PROGRAM when not root
    #[arg(
        long,
        global = true,
        value_name = "PROGRAM",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "sudo"
    )]
    elevate: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a VPN server
    Connect(ConnectArgs),
    /// Disconnect the active session
    Disconnect {
        /// Seconds to wait for openconnect to log out before sending SIGTERM
        #[arg(long, value_name = "SECONDS", default_value_t = 10)]
        timeout: u64,
    },
    /// Show whether a session is active
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Manage the saved connection settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Interactive menu
    Menu(SessionArgs),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the saved configuration
    Show,
    /// Change saved settings from the command line
    Set(ConfigArgs),
    /// Edit the saved settings interactively
    Edit,
    /// Delete the saved configuration
    Clear,
}

/// Connection settings; unset flags fall back to the saved configuration
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// VPN server hostname or URL (e.g. vpn.example.com)
    server: Option<String>,

    /// VPN username
    #[arg(short, long)]
    username: Option<String>,

    /// Auth group/profile, if the server asks for one
    #[arg(long, value_name = "GROUP")]
    authgroup: Option<String>,

    /// TUN interface name (default: tun0)
    #[arg(long, value_name = "NAME")]
    interface: Option<String>,

    /// Pin the server certificate, e.g. "pin-sha256:BASE64..."
    #[arg(long, value_name = "PIN")]
    servercert: Option<String>,

    /// Disable DTLS/UDP (force TLS/TCP)
    #[arg(long, conflicts_with = "dtls")]
    no_dtls: bool,

    /// Use DTLS/UDP even if the saved configuration disables it
    #[arg(long)]
    dtls: bool,

    /// Write openconnect's output to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Extra openconnect arguments, one token each; must come last
    #[arg(long, value_name = "ARG", num_args = 1.., allow_hyphen_values = true)]
    extra: Option<Vec<String>>,
}

impl ConfigArgs {
    fn into_patch(self) -> ConfigPatch {
        let disable_dtls = if self.no_dtls {
            Some(true)
        } else if self.dtls {
            Some(false)
        } else {
            None
        };

        ConfigPatch {
            server: self.server,
            username: self.username,
            auth_group: self.authgroup,
            interface_name: self.interface,
            server_cert_pin: self.servercert,
            disable_dtls,
            log_file_path: self.log_file,
            extra_args: self.extra,
        }
    }
}

/// How openconnect is run
#[derive(Args, Debug, Default)]
struct SessionArgs {
    /// Path to the openconnect binary (default: search $PATH)
    #[arg(long, value_name = "PATH")]
    openconnect_path: Option<PathBuf>,

    /// Keep openconnect attached to this terminal until Ctrl+C
    #[arg(long)]
    foreground: bool,

    /// Let openconnect ask for credentials itself
    #[arg(long)]
    interactive_auth: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    #[command(flatten)]
    fields: ConfigArgs,

    #[command(flatten)]
    session: SessionArgs,

    /// Seconds to wait for the tunnel to come up
    #[arg(long, value_name = "SECONDS", default_value_t = 120)]
    connect_timeout: u64,

    /// Save the resulting settings as the new configuration
    #[arg(long)]
    save: bool,
}

struct Context {
    store: ConfigStore,
    paths: SessionPaths,
    /// `--state-dir` was given
    explicit_state_dir: bool,
    elevate: Option<String>,
}

impl Context {
    fn manager(&self, settings: SessionSettings) -> SessionManager<SystemProcessControl> {
        self.manager_in(self.paths.clone(), settings)
    }

    fn manager_in(
        &self,
        paths: SessionPaths,
        settings: SessionSettings,
    ) -> SessionManager<SystemProcessControl> {
        let mut control = SystemProcessControl::new(self.elevate.clone());
        if let Some(client) = &settings.openconnect {
            control = control.with_client(client);
        }
        SessionManager::new(control, paths, settings)
    }

    fn status(&self) -> Result<SessionReport, SessionError> {
        let report = self.manager(SessionSettings::default()).status()?;
        let system_dir = Path::new(SYSTEM_STATE_DIR);
        if report != SessionReport::Disconnected
            || self.explicit_state_dir
            || self.paths.dir == system_dir
        {
            return Ok(report);
        }

        // `sudo ocvpn connect` keeps its marker in the system directory
        debug!("No session in {}, checking {}", self.paths.dir.display(), SYSTEM_STATE_DIR);
        self.manager_in(SessionPaths::in_dir(system_dir), SessionSettings::default())
            .status()
    }
}

fn session_settings(args: &SessionArgs) -> SessionSettings {
    SessionSettings {
        openconnect: args.openconnect_path.clone(),
        background: !args.foreground,
        ..SessionSettings::default()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable (status --json)
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {e}");
    }

    if let Err(e) = run(cli).await {
        error!("{}", e);
        if let Some(hint) = e.hint() {
            eprintln!("hint: {hint}");
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), SessionError> {
    let context = Context {
        store: cli
            .config
            .map(ConfigStore::new)
            .unwrap_or_else(ConfigStore::at_default_location),
        explicit_state_dir: cli.state_dir.is_some(),
        paths: SessionPaths::in_dir(&cli.state_dir.unwrap_or_else(SessionPaths::default_dir)),
        elevate: cli.elevate,
    };

    match cli.command {
        Commands::Connect(args) => connect(&context, args).await,
        Commands::Disconnect { timeout } => {
            let settings = SessionSettings {
                disconnect_timeout: Duration::from_secs(timeout),
                ..SessionSettings::default()
            };
            let pid = context.manager(settings).disconnect().await?;
            println!("Disconnected (pid {pid})");
            Ok(())
        }
        Commands::Status { json } => {
            let report = context.status()?;
            if json {
                let line = serde_json::to_string(&report).map_err(|e| SessionError::Io {
                    path: PathBuf::from("<stdout>"),
                    source: std::io::Error::other(e),
                })?;
                println!("{line}");
            } else {
                println!("{report}");
            }
            Ok(())
        }
        Commands::Config { action } => config_command(&context.store, action),
        Commands::Menu(args) => {
            let mut manager = context.manager(session_settings(&args));
            let mut prompter = TerminalPrompter;
            Menu::new(&mut manager, &context.store, &mut prompter, std::io::stdout())
                .interactive_auth(args.interactive_auth)
                .run()
                .await
                .map_err(|source| SessionError::Io {
                    path: PathBuf::from("<terminal>"),
                    source,
                })
        }
    }
}

async fn connect(context: &Context, args: ConnectArgs) -> Result<(), SessionError> {
    let mut config = args.fields.into_patch().apply(context.store.load_or_default()?);
    config.validate()?;

    let settings = SessionSettings {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        ..session_settings(&args.session)
    };
    let mut manager = context.manager(settings);
    // Before asking for a password that could not be used anyway
    manager.check_privilege()?;

    let credentials =
        acquire_credentials(&mut TerminalPrompter, &mut config, args.session.interactive_auth)?;
    if args.save {
        context.store.save(&config)?;
        info!("Saved configuration to {}", context.store.path().display());
    }

    let session = manager.connect(&config, &credentials).await?;
    if !session.is_foreground() {
        println!("Connected to {} (pid {})", config.server, session.pid());
        return Ok(());
    }

    println!(
        "Connected to {} (pid {}). Press Ctrl+C to disconnect.",
        config.server,
        session.pid()
    );
    let code = manager.supervise(session, platform::interrupted()).await?;
    info!("openconnect exited: {:?}", code);
    Ok(())
}

fn config_command(store: &ConfigStore, action: ConfigCommand) -> Result<(), SessionError> {
    match action {
        ConfigCommand::Show => {
            let config = store.load()?;
            println!("# {}", store.path().display());
            print!("{}", config.to_toml()?);
        }
        ConfigCommand::Set(args) => {
            let config = args.into_patch().apply(store.load_or_default()?);
            store.save(&config)?;
            println!("Saved {}", store.path().display());
        }
        ConfigCommand::Edit => {
            let config = acquire_config(&mut TerminalPrompter, &store.load_or_default()?)?;
            store.save(&config)?;
            println!("Saved {}", store.path().display());
        }
        ConfigCommand::Clear => {
            store.delete()?;
            println!("Removed {}", store.path().display());
        }
    }
    Ok(())
}
