use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use mima_core::{
    generate_password, normalize_domain, Action, FormKind, FormObservation, PasswordPolicy,
    SyncConfig, TabBroadcaster, DEFAULT_LENGTH,
};
use mima_protocol::CredentialRecord;
use mima_sync::{
    bind_socket, Authority, BrowsingContext, ContextEvent, MemoryStore, SyncBridge, UnixConnector,
};
use output::{ObserveReport, QueryReport};
use serde::Serialize;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod output;
mod socket;

pub use socket::{resolve_socket_path, socket_path_from_env, SOCKET_ENV};

#[derive(Parser)]
#[command(name = "mima")]
#[command(about = "Credential sync between browser contexts and the Mima authority", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,

    /// TOML file with sync settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Authority socket (overrides MIMA_SOCKET)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference authority on the socket
    Authority(AuthorityArgs),

    /// Show autofill candidates for a domain
    Query(QueryArgs),

    /// Submit a login or change-password form and report the save decision
    Observe(ObserveArgs),

    /// Generate a random password
    #[command(name = "generate-password")]
    GeneratePassword(GenerateArgs),

    /// Print the effective sync settings as TOML
    Config,
}

#[derive(Args)]
struct AuthorityArgs {
    /// JSON array of records to preload
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Args)]
struct QueryArgs {
    domain: String,

    /// Include passwords in the output
    #[arg(long)]
    reveal: bool,
}

#[derive(Args)]
struct ObserveArgs {
    domain: String,

    username: String,

    /// Password as typed (prefer --password-stdin)
    #[arg(long, conflicts_with = "password_stdin", required_unless_present = "password_stdin")]
    password: Option<String>,

    /// Read the password from the first line of stdin
    #[arg(long)]
    password_stdin: bool,

    /// The form was a change-password form
    #[arg(long)]
    change_password: bool,
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, default_value_t = DEFAULT_LENGTH)]
    length: usize,

    #[arg(long)]
    no_uppercase: bool,

    #[arg(long)]
    no_lowercase: bool,

    #[arg(long)]
    no_digits: bool,

    #[arg(long)]
    no_symbols: bool,
}

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    print_stdout(&serde_json::to_string_pretty(value)?)
}

fn init_logging(cli: &Cli) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config
        .with_env_overrides()
        .context("Invalid MIMA_* environment override")
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(cli.config.as_deref())?;
    let socket = resolve_socket_path(cli.socket.as_deref());

    match cli.command {
        Commands::Authority(args) => run_authority(&socket, args.seed.as_deref()).await,
        Commands::Query(args) => run_query(&socket, &config, args).await,
        Commands::Observe(args) => run_observe(&socket, &config, args).await,
        Commands::GeneratePassword(args) => run_generate(&args),
        Commands::Config => print_stdout(
            toml::to_string(&config)
                .context("Failed to render config")?
                .trim_end(),
        ),
    }
}

fn open_context(socket: &Path, config: &SyncConfig) -> BrowsingContext {
    let bridge = SyncBridge::from_config(
        UnixConnector::new(socket),
        TabBroadcaster::default(),
        config,
    );
    BrowsingContext::open(bridge, config)
}

async fn run_authority(socket: &Path, seed: Option<&Path>) -> Result<()> {
    let records: Vec<CredentialRecord> = match seed {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read seed {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid seed {}", path.display()))?
        }
        None => Vec::new(),
    };
    let seeded = records.len();
    let store = MemoryStore::with_records(records).context("Invalid seed record")?;
    let authority = Authority::new(store);

    let listener = bind_socket(socket)
        .await
        .with_context(|| format!("Failed to bind {}", socket.display()))?;
    log::info!(
        "authority listening on {} ({seeded} seeded records)",
        socket.display()
    );

    let outcome = tokio::select! {
        res = authority.serve(listener) => res.context("Accept failed"),
        res = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            res.context("Signal handler failed")
        }
    };
    if let Err(err) = std::fs::remove_file(socket) {
        log::debug!("could not remove {}: {err}", socket.display());
    }
    outcome
}

async fn run_query(socket: &Path, config: &SyncConfig, args: QueryArgs) -> Result<()> {
    let domain = normalize_domain(&args.domain);
    if domain.is_empty() {
        bail!("No host in {:?}", args.domain);
    }
    let ctx = open_context(socket, config);
    let result = ctx.autofill_ready(&domain).await?;
    ctx.close().await;
    print_json(&QueryReport::new(domain, &result, args.reveal))
}

fn read_password_line() -> Result<String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_observe(socket: &Path, config: &SyncConfig, args: ObserveArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => read_password_line()?,
    };
    let kind = if args.change_password {
        FormKind::ChangePassword
    } else {
        FormKind::Login
    };
    let observation = FormObservation::new(args.domain, args.username, password, kind);

    let mut ctx = open_context(socket, config);
    ctx.observe(observation).await?;

    // Settle, then at most a fill and a mutate.
    let budget = config.settle_window() + config.query_timeout() * 2 + Duration::from_secs(1);
    let report = tokio::time::timeout(budget, async {
        while let Some(event) = ctx.next_event().await {
            match event {
                ContextEvent::Classified {
                    domain,
                    action: Action::NoAction { id },
                } => return Ok(ObserveReport::unchanged(domain, id)),
                ContextEvent::Classified { domain, action } => {
                    log::debug!("{domain}: {:?}", action.mutate_action());
                }
                ContextEvent::Saved { action, record } => {
                    return Ok(ObserveReport::saved(action, &record));
                }
                ContextEvent::SaveFailed { domain, error } => {
                    return Ok(ObserveReport::failed(domain, "save_failed", &error));
                }
                ContextEvent::Suspended { domain, error } => {
                    return Ok(ObserveReport::failed(domain, "suspended", &error));
                }
            }
        }
        Err(anyhow!("Browsing context ended before a decision"))
    })
    .await
    .context("No decision before the deadline")??;
    ctx.close().await;

    print_json(&report)?;
    if report.is_failure() {
        bail!("Submission was not stored");
    }
    Ok(())
}

fn run_generate(args: &GenerateArgs) -> Result<()> {
    let policy = PasswordPolicy {
        length: args.length,
        uppercase: !args.no_uppercase,
        lowercase: !args.no_lowercase,
        digits: !args.no_digits,
        symbols: !args.no_symbols,
    };
    let secret = generate_password(&policy)?;
    print_stdout(secret.expose())
}
