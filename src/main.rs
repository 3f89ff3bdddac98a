use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_scanner::{
    proxy::checker::{detect_public_ip, parse_public_ip, DEFAULT_ECHO_URL, DEFAULT_PUBLIC_IP_URL},
    scanner::blacklist::{Blacklist, DEFAULT_BLOCKLIST_PREFIX},
    tui::Dashboard,
    CheckOutcome, CheckerConfig, Database, GeoLocator, LocationProvider, NoLocation, ProxyChecker,
    ProxyFilter, ProxyStore, ProxyType, ReqwestTransport, Scanner, ScannerConfig,
    ScannerSettingsUpdate, SettingsStore, Source, StaticSource, TxtListSource,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

/// Continuously discovers, validates and ranks public proxies
#[derive(Parser)]
#[command(name = "proxy-scanner")]
#[command(about = "Continuously discovers, validates and ranks public proxies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database URL
    #[arg(short, long, default_value = "sqlite://proxies.db")]
    database: String,

    /// MaxMind city database used to locate proxies
    #[arg(long)]
    mmdb: Option<PathBuf>,

    /// Directory holding cached blacklist files
    #[arg(long, default_value = "cache/blacklists")]
    cache_dir: PathBuf,

    /// Debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Args, Clone, Default)]
struct RunOptions {
    /// File of proxies to check on start (one per line)
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Proxy type for seed lines without a scheme (http, https, socks4, socks5)
    #[arg(short = 't', long, default_value = "http")]
    seed_type: String,
    /// Do not poll the built-in public proxy lists
    #[arg(long)]
    no_default_sources: bool,
    /// Skip public IP detection and use this address
    #[arg(long)]
    public_ip: Option<String>,
    /// Header-echo endpoint for the primary probe
    #[arg(long, default_value = DEFAULT_ECHO_URL)]
    echo_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scanner until Ctrl-C
    Run(RunOptions),
    /// Run the scanner with a live dashboard
    Dashboard(RunOptions),
    /// Check one proxy URI; the attempt is added to the ping log
    Check {
        uri: String,
        #[arg(long)]
        public_ip: Option<String>,
        #[arg(long, default_value = DEFAULT_ECHO_URL)]
        echo_url: String,
    },
    /// Test whether a proxy URI or IP is on the configured blacklists
    Blacklist { target: String },
    /// Show or change scanner settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// List proxies in the pool, fastest first
    List {
        /// Show dead proxies instead of alive ones
        #[arg(long)]
        dead: bool,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// ISO country codes to keep
        #[arg(short, long)]
        country: Vec<String>,
        #[arg(long)]
        min_reliability: Option<f64>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set {
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        alive_interval: Option<u64>,
        #[arg(long)]
        dead_interval: Option<u64>,
        #[arg(long)]
        timeout: Option<u64>,
        /// Blacklist file names, comma separated
        #[arg(long, value_delimiter = ',')]
        blacklists: Option<Vec<String>>,
        #[arg(long)]
        refresh_hours: Option<u64>,
    },
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // the dashboard owns stdout, so it logs to a file
    if matches!(cli.command, Some(Commands::Dashboard(_))) {
        let file_appender = tracing_appender::rolling::daily("logs", "proxy-scanner.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(non_blocking)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(Some(guard));
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let db = Arc::new(Database::new(&cli.database).await?);

    match &cli.command {
        Some(Commands::Run(opts)) => run_until_interrupted(build_scanner(&cli, db, opts)?).await?,
        None => {
            let scanner = build_scanner(&cli, db, &RunOptions::default_run())?;
            run_until_interrupted(scanner).await?;
        }
        Some(Commands::Dashboard(opts)) => {
            let scanner = Arc::new(build_scanner(&cli, db, opts)?);
            scanner.start().await?;
            let mut dashboard = Dashboard::new(scanner.clone());
            let result = dashboard.run().await;
            scanner.teardown().await;
            result?;
        }
        Some(Commands::Check {
            uri,
            public_ip,
            echo_url,
        }) => {
            let public_ip = match public_ip {
                Some(ip) => parse_public_ip(ip)?,
                None => detect_public_ip(DEFAULT_PUBLIC_IP_URL).await?,
            };
            let settings = SettingsStore::load(db.as_ref()).await?.unwrap_or_default();
            let config = CheckerConfig::new(public_ip).with_echo_url(echo_url.clone());
            let checker = ProxyChecker::new(config, Arc::new(ReqwestTransport::new()), db.clone());

            match checker
                .check(uri, &settings.websites, settings.check_timeout())
                .await
            {
                CheckOutcome::Alive(result) => {
                    println!("{} is alive", uri);
                    println!("  speed:        {:.3}s", result.speed);
                    println!("  anonymity:    {}", result.anonymity);
                    println!("  accessible:   {}", result.accessible.join(", "));
                    println!("  inaccessible: {}", result.inaccessible.join(", "));
                }
                CheckOutcome::Dead(kind) => println!("{} is dead ({})", uri, kind),
            }
        }
        Some(Commands::Blacklist { target }) => {
            let settings = SettingsStore::load(db.as_ref()).await?.unwrap_or_default();
            let blacklist = Blacklist::new(DEFAULT_BLOCKLIST_PREFIX, cli.cache_dir.clone(), Vec::new())?;
            blacklist.set_blocklist(settings.blacklist_files).await;

            let hit = match target.parse::<Ipv4Addr>() {
                Ok(ip) => blacklist.contains_ip(ip).await,
                Err(_) => blacklist.is_blacklisted(target).await,
            };
            for (name, entries) in blacklist.loaded().await {
                println!("{}: {} entries", name, entries);
            }
            if hit {
                println!("{} is blacklisted", target);
            } else {
                println!("{} is not blacklisted", target);
            }
        }
        Some(Commands::Settings { action }) => {
            let scanner = build_scanner(&cli, db.clone(), &RunOptions::default_run())?;
            let settings = match action {
                SettingsAction::Show => SettingsStore::load(db.as_ref()).await?.unwrap_or_default(),
                SettingsAction::Set {
                    threads,
                    alive_interval,
                    dead_interval,
                    timeout,
                    blacklists,
                    refresh_hours,
                } => {
                    let update = ScannerSettingsUpdate {
                        num_scan_threads: *threads,
                        alive_check_interval_minutes: *alive_interval,
                        dead_check_interval_minutes: *dead_interval,
                        scan_check_timeout_seconds: *timeout,
                        blacklist_files: blacklists.clone(),
                        blacklist_refresh_hours: *refresh_hours,
                        websites: None,
                    };
                    scanner.hot_change_settings(update).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!(
                "Available blacklists: {}",
                scanner.get_available_blacklist_names().join(", ")
            );
        }
        Some(Commands::List {
            dead,
            limit,
            country,
            min_reliability,
        }) => {
            let mut filter = if *dead {
                ProxyFilter::dead()
            } else {
                ProxyFilter::alive()
            }
            .with_limit(*limit);
            if !country.is_empty() {
                filter = filter.with_countries(country.clone());
            }
            if let Some(reliability) = min_reliability {
                filter = filter.with_min_reliability(*reliability);
            }

            let proxies = db.find_by(&filter).await?;
            if proxies.is_empty() {
                println!("No proxies found.");
            }
            for proxy in proxies {
                let country = proxy
                    .location
                    .as_ref()
                    .map(|l| l.country.as_str())
                    .unwrap_or("??");
                println!(
                    "{} {:.3}s {} {:.0}% {}",
                    proxy.uri,
                    proxy.speed,
                    proxy.anonymity,
                    proxy.reliability * 100.0,
                    country
                );
            }
        }
    }

    Ok(())
}

async fn run_until_interrupted(scanner: Scanner) -> Result<()> {
    scanner.start().await?;
    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    scanner.teardown().await;
    Ok(())
}

impl RunOptions {
    fn default_run() -> Self {
        Self {
            seed_type: "http".to_string(),
            echo_url: DEFAULT_ECHO_URL.to_string(),
            ..Default::default()
        }
    }
}

fn build_scanner(cli: &Cli, db: Arc<Database>, opts: &RunOptions) -> Result<Scanner> {
    let mut config = ScannerConfig::new()
        .with_cache_dir(cli.cache_dir.clone())
        .with_echo_url(opts.echo_url.clone());
    if let Some(ip) = &opts.public_ip {
        config = config.with_public_ip(ip.clone());
    }

    let locator: Arc<dyn LocationProvider> = match &cli.mmdb {
        Some(path) => Arc::new(
            GeoLocator::from_path(path)
                .with_context(|| format!("Failed to open MMDB {:?}", path))?,
        ),
        None => Arc::new(NoLocation),
    };

    let mut builder = Scanner::builder(config).store(db).locator(locator);
    if !opts.no_default_sources {
        let source: Arc<dyn Source> = Arc::new(TxtListSource::new(TxtListSource::common_lists())?);
        builder = builder.source(source);
    }
    if let Some(seed) = &opts.seed {
        let seed_type = parse_proxy_type(&opts.seed_type)?;
        let source: Arc<dyn Source> = Arc::new(StaticSource::from_file(seed, 60, seed_type)?);
        builder = builder.source(source);
    }
    builder.build()
}

fn parse_proxy_type(s: &str) -> Result<ProxyType> {
    ProxyType::from_scheme(s)
        .ok_or_else(|| anyhow!("Invalid proxy type: {}. Use: http, https, socks4, socks5", s))
}
