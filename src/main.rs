use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod batch;
mod config;
mod engine;
mod error;
mod history;
mod progress;
mod scrobble;
mod service;

use crate::batch::{MAX_BATCH_SIZE, RequestOptions};
use crate::config::{Config, default_config_path, load_config, save_config};
use crate::engine::{BackoffPolicy, EngineConfig, RunReport, SubmissionEngine, SystemTimer};
use crate::history::{ContentKind, PlayRecord, load_history};
use crate::progress::ProgressStore;
use crate::scrobble::{
    DateRange, FinishAt, ImportMode, PipelineOptions, ScrobbleCandidate, build_candidates,
    parse_date,
};
use crate::service::{Credentials, Service, ServiceClient, ignored_reason};

#[derive(Parser)]
#[command(
    name = "backscrobble",
    version,
    about = "Scrobble Spotify extended streaming history"
)]
struct Cli {
    #[arg(long, value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = false,
        global = true,
        help = "Log redacted requests and raw responses"
    )]
    debug: bool,
    #[arg(long, value_name = "PATH", global = true, help = "Append logs to a file")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommand,
    },
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Send one test scrobble to verify write access
    Probe,
    Scrobble(ScrobbleArgs),
}

#[derive(Subcommand)]
enum CredentialsCommand {
    Set {
        #[arg(long, help = "API key")]
        api_key: String,
        #[arg(long, help = "API secret")]
        api_secret: String,
        #[arg(long, default_value = "lastfm", value_parser = Service::parse)]
        service: Service,
    },
}

#[derive(Subcommand)]
enum AuthCommand {
    Login {
        #[arg(
            long,
            help = "Authenticate with username and password instead of the browser"
        )]
        username: Option<String>,
    },
    Reset,
}

#[derive(Parser)]
struct ScrobbleArgs {
    #[arg(
        long,
        required = true,
        num_args = 1..,
        value_name = "PATH",
        help = "History JSON files or directories"
    )]
    input: Vec<PathBuf>,
    #[arg(long, value_parser = parse_date, help = "Only plays starting on/after this date (YYYY-MM-DD)")]
    since: Option<NaiveDate>,
    #[arg(long, value_parser = parse_date, help = "Only plays starting before this date (YYYY-MM-DD)")]
    until: Option<NaiveDate>,
    #[arg(long, default_value_t = false, help = "Send duration seconds from ms_played")]
    include_duration: bool,
    #[arg(
        long = "no-chosen-by-user",
        action = ArgAction::SetFalse,
        default_value_t = true,
        help = "Do not send chosenByUser"
    )]
    chosen_by_user: bool,
    #[arg(
        long,
        default_value_t = false,
        help = "Re-date plays into a dense window ending at --finish-at"
    )]
    import_mode: bool,
    #[arg(long, default_value = "now", value_parser = FinishAt::parse)]
    finish_at: FinishAt,
    #[arg(long, default_value_t = 1, help = "Seconds between re-dated plays")]
    gap_sec: i64,
    #[arg(long, help = "Max scrobbles to process after filtering")]
    limit: Option<usize>,
    #[arg(long, value_name = "PATH", help = "Progress file for resuming interrupted runs")]
    state: Option<PathBuf>,
    #[arg(long, default_value_t = MAX_BATCH_SIZE, help = "Scrobbles per request (1-50)")]
    batch_size: usize,
    #[arg(long, default_value_t = 10)]
    base_backoff_sec: u64,
    #[arg(long, default_value_t = 300)]
    max_backoff_sec: u64,
    #[arg(
        long,
        default_value_t = 6,
        help = "Consecutive failures before waiting for UTC midnight"
    )]
    max_retries: u32,
    #[arg(long, default_value_t = 500, help = "Pause between requests")]
    pause_ms: u64,
    #[arg(
        long,
        default_value_t = false,
        help = "Build requests without submitting"
    )]
    dry_run: bool,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    api_secret: Option<String>,
    #[arg(long)]
    session_key: Option<String>,
}

impl ScrobbleArgs {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            range: DateRange {
                since: self.since,
                until: self.until,
            },
            request: self.request_options(),
            import_mode: self.import_mode.then_some(ImportMode {
                finish_at: self.finish_at,
                gap_seconds: self.gap_sec.max(1),
            }),
            limit: self.limit,
        }
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            include_duration: self.include_duration,
            send_chosen_by_user: self.chosen_by_user,
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: BackoffPolicy {
                base: Duration::from_secs(self.base_backoff_sec.max(1)),
                max: Duration::from_secs(self.max_backoff_sec.max(self.base_backoff_sec)),
                max_retries: self.max_retries,
            },
            batch_size: self.batch_size.clamp(1, MAX_BATCH_SIZE),
            pause: Duration::from_millis(self.pause_ms),
            request: self.request_options(),
            dry_run: self.dry_run,
        }
    }

    fn credentials(&self, config: &Config) -> Result<Credentials> {
        let mut config = config.clone();
        if let Some(api_key) = &self.api_key {
            config.api_key = Some(api_key.clone());
        }
        if let Some(api_secret) = &self.api_secret {
            config.api_secret = Some(api_secret.clone());
        }
        if let Some(session_key) = &self.session_key {
            config.session_key = Some(session_key.clone());
        }
        match config.credentials() {
            Ok(credentials) => Ok(credentials),
            Err(_) if self.dry_run => Ok(Credentials {
                api_key: config.api_key.unwrap_or_default(),
                api_secret: config.api_secret.unwrap_or_default(),
                session_key: config.session_key.unwrap_or_default(),
            }),
            Err(err) => Err(err),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.debug, cli.log_file.as_deref()) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug {
            "warn,backscrobble=debug"
        } else {
            "warn,backscrobble=info"
        })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed opening log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path.unwrap_or_else(default_config_path);
    match cli.command {
        Commands::Credentials { command } => match command {
            CredentialsCommand::Set {
                api_key,
                api_secret,
                service,
            } => {
                let mut config = load_config(&config_path)?;
                if config.service != service {
                    config.reset_session();
                    config.service = service;
                }
                config.set_keys(&api_key, &api_secret);
                save_config(&config, &config_path)?;
                println!("Saved API keys in {}", config_path.display());
            }
        },
        Commands::Auth { command } => handle_auth(command, &config_path)?,
        Commands::Probe => handle_probe(&config_path)?,
        Commands::Scrobble(args) => handle_scrobble(&args, &config_path)?,
    }
    Ok(())
}

fn handle_auth(command: AuthCommand, config_path: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;
    match command {
        AuthCommand::Login { username } => {
            let (api_key, api_secret) = config.service_keys()?;
            let client = ServiceClient::new(config.service)?;
            let session = match username {
                Some(username) => {
                    let password = rpassword::prompt_password("Password: ")?;
                    client.request_mobile_session(&api_key, &api_secret, &username, &password)?
                }
                None => {
                    let token = client.request_token(&api_key, &api_secret)?;
                    println!("Open this URL and allow access:");
                    println!("{}", client.authorize_url(&api_key, &token)?);
                    print!("Press Enter once approved...");
                    io::stdout().flush()?;
                    io::stdin().lock().read_line(&mut String::new())?;
                    client.request_session(&api_key, &api_secret, &token)?
                }
            };
            config.set_session(&session.name, &session.key);
            save_config(&config, config_path)?;
            println!("Authenticated as {}", session.name);
        }
        AuthCommand::Reset => {
            if config.reset_session() {
                save_config(&config, config_path)?;
                println!("Forgot cached session in {}", config_path.display());
            } else {
                println!("No cached session.");
            }
        }
    }
    Ok(())
}

fn handle_probe(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let credentials = config.credentials()?;
    let timestamp = Utc::now().timestamp() - 120;
    let probe = ScrobbleCandidate {
        record: PlayRecord {
            artist: "Nirvana".to_string(),
            track: "Smells Like Teen Spirit".to_string(),
            album: Some("Nevermind".to_string()),
            end_time: timestamp + 300,
            ms_played: 300_000,
            offline_timestamp: None,
            kind: ContentKind::Music,
            private: false,
            chosen_by_user: true,
        },
        timestamp,
    };
    let engine_config = EngineConfig {
        pause: Duration::ZERO,
        request: RequestOptions {
            include_duration: true,
            send_chosen_by_user: false,
        },
        ..EngineConfig::default()
    };
    let client = ServiceClient::new(config.service)?;
    let report = SubmissionEngine::new(credentials, client, SystemTimer, engine_config)
        .run(std::slice::from_ref(&probe))?;
    println!(
        "Probe: accepted={} ignored={}",
        report.accepted,
        report.ignored_total()
    );
    Ok(())
}

fn handle_scrobble(args: &ScrobbleArgs, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let credentials = args.credentials(&config)?;
    let options = args.pipeline_options();

    info!("Reading {} input(s)", args.input.len());
    let entries = load_history(&args.input);
    if entries.is_empty() {
        bail!("No history entries found.");
    }
    let (candidates, _) = build_candidates(&entries, &options, Utc::now());
    if candidates.is_empty() {
        println!("Nothing to scrobble after filtering.");
        return Ok(());
    }

    let client = ServiceClient::new(config.service)?;
    let mut engine = SubmissionEngine::new(credentials, client, SystemTimer, args.engine_config());
    if let Some(state) = &args.state {
        engine = engine.with_progress(ProgressStore::new(state, options.fingerprint()));
    }
    let report = engine.run(&candidates)?;
    print_report(&report, candidates.len());
    Ok(())
}

fn print_report(report: &RunReport, total: usize) {
    if report.dry_run {
        println!(
            "Finished. {} scrobbles in {} batches would be submitted (dry-run).",
            report.submitted, report.batches
        );
        return;
    }
    println!(
        "Finished. Submitted {} scrobbles in {} batches: {} accepted, {} ignored. Progress {}/{}.",
        report.submitted,
        report.batches,
        report.accepted,
        report.ignored_total(),
        report.offset,
        total
    );
    for (code, count) in &report.ignored {
        println!("  {count} ignored: {} (code {code})", ignored_reason(*code));
    }
}
