use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use config::Config;
use dashboard::{Dashboard, DashboardSettings, spawn_push_refresh};
use db::Database;
use table::TableSnapshot;
use window::WindowBounds;

mod aggregate;
mod config;
mod dashboard;
mod db;
mod diff;
mod layout;
mod logging;
mod source;
mod store;
mod table;
mod types;
mod utils;
mod watcher;
mod window;

/// Quiet period after the last database write before refreshing
const WRITE_DEBOUNCE: Duration = Duration::from_millis(750);
const WATCH_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "tripboard")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database file to read (defaults to the configured one)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the database and print each refresh as JSON (default)
    Watch,
    /// Print the full dashboard layout as JSON
    Layout(OutputArgs),
    /// Print the view for a time window as JSON
    Window(WindowArgs),
    /// Reconcile an edited charging table with the database
    Edit(EditArgs),
    /// Switch ABRP forwarding for a vehicle
    Abrp(AbrpArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct OutputArgs {
    /// Pretty-print JSON instead of a single line
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Args)]
struct WindowArgs {
    /// Window start, epoch milliseconds or RFC 3339 (defaults to the first trip)
    #[arg(long)]
    from: Option<String>,

    /// Window end, epoch milliseconds or RFC 3339 (defaults to the last trip)
    #[arg(long)]
    to: Option<String>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct EditArgs {
    /// JSON snapshot of the table before the edit
    #[arg(long)]
    previous: PathBuf,

    /// JSON snapshot of the table after the edit
    #[arg(long)]
    current: PathBuf,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Args)]
struct AbrpArgs {
    vin: String,
    #[arg(value_enum)]
    state: Switch,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (database-path, title, vin, timezone, default-price)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init() {
        eprintln!("Error setting up logging: {e:#}");
    }

    let result = match cli.command {
        None | Some(Commands::Watch) => run_watch(cli.db.as_deref()).await,
        Some(Commands::Layout(args)) => run_layout(cli.db.as_deref(), args).await,
        Some(Commands::Window(args)) => run_window(cli.db.as_deref(), args).await,
        Some(Commands::Edit(args)) => run_edit(cli.db.as_deref(), args).await,
        Some(Commands::Abrp(args)) => run_abrp(cli.db.as_deref(), args).await,
        Some(Commands::Config(config_args)) => {
            handle_config_subcommand(config_args);
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("Ignoring configuration: {e:#}");
            Config::default()
        }
    }
}

/// Open the database, price unpriced sessions and run the first refresh.
async fn open_dashboard(
    db_override: Option<&Path>,
    config: &Config,
) -> Result<(Arc<Database>, Arc<Dashboard>)> {
    let path = match db_override {
        Some(path) => path.to_path_buf(),
        None => config.database_path()?,
    };
    let db = Arc::new(Database::open(&path)?);

    let priced = db.set_default_price(config.charging.default_price_per_kwh)?;
    if priced > 0 {
        info!(sessions = priced, "Priced charging sessions at the default rate");
    }

    let dashboard = Arc::new(Dashboard::new(
        db.clone(),
        db.clone(),
        DashboardSettings::from(config),
    ));
    dashboard.refresh().await;
    Ok((db, dashboard))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        simd_json::to_string_pretty(value)?
    } else {
        simd_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

async fn run_layout(db: Option<&Path>, args: OutputArgs) -> Result<()> {
    let config = load_config();
    let (_db, dashboard) = open_dashboard(db, &config).await?;
    let view = dashboard.get_layout();
    if view.is_error() {
        warn!("No data to show for {}", dashboard.settings().title);
    }
    print_json(view.as_ref(), args.pretty)
}

async fn run_window(db: Option<&Path>, args: WindowArgs) -> Result<()> {
    let config = load_config();
    let (_db, dashboard) = open_dashboard(db, &config).await?;

    let full = dashboard
        .dataset()
        .window
        .as_ref()
        .map(|w| w.full_range())
        .unwrap_or(WindowBounds::new(0, 0));
    let lo = match args.from.as_deref() {
        Some(from) => utils::parse_time_arg(from)?,
        None => full.lo,
    };
    let hi = match args.to.as_deref() {
        Some(to) => utils::parse_time_arg(to)?,
        None => full.hi,
    };

    let view = dashboard.filter_by_window(WindowBounds::new(lo, hi));
    print_json(&view, args.output.pretty)
}

fn read_snapshot(path: &Path) -> Result<TableSnapshot> {
    let mut bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    simd_json::from_slice(&mut bytes)
        .with_context(|| format!("Failed to parse table snapshot {}", path.display()))
}

async fn run_edit(db: Option<&Path>, args: EditArgs) -> Result<()> {
    let previous = read_snapshot(&args.previous)?;
    let current = read_snapshot(&args.current)?;

    let config = load_config();
    let (_db, dashboard) = open_dashboard(db, &config).await?;
    let edit = dashboard
        .apply_table_edit(&previous, &current)
        .context("Invalid table snapshots")?;
    print_json(&edit, args.output.pretty)
}

async fn run_abrp(db: Option<&Path>, args: AbrpArgs) -> Result<()> {
    let mut config = load_config();
    let (_db, dashboard) = open_dashboard(db, &config).await?;

    if dashboard.vehicles().is_empty() {
        anyhow::bail!("No vehicle data loaded yet, cannot switch ABRP for {}", args.vin);
    }
    let enabled = matches!(args.state, Switch::On);
    let vins = dashboard.set_abrp(&args.vin, enabled)?;
    config.set_abrp_vins(vins);
    config.save(false)
}

async fn run_watch(db: Option<&Path>) -> Result<()> {
    let config = load_config();
    let (db, dashboard) = open_dashboard(db, &config).await?;

    let data = dashboard.dataset();
    let distance_km: f64 = data.trips.iter().map(|t| t.distance_km).sum();
    info!(
        "Loaded {} trips over {} km",
        utils::format_number(data.trips.len() as u64),
        utils::format_number(distance_km.max(0.0).round() as u64)
    );

    let mut updates = dashboard.subscribe();
    if let Some(result) = updates.borrow_and_update().as_ref() {
        print_json(result, false)?;
    }
    let _refresher = spawn_push_refresh(dashboard.clone());

    let db_watcher = watcher::DbWatcher::new(db.path())?;
    let mut debouncer = watcher::ChangeDebouncer::new(WRITE_DEBOUNCE);
    let mut poll = tokio::time::interval(WATCH_POLL);
    info!(db = %db.path().display(), "Watching for new data");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                let now = Instant::now();
                while let Some(event) = db_watcher.try_recv() {
                    debouncer.handle_watcher_event(event, now);
                }
                if debouncer.take_due(now) {
                    db.notify_new_data();
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let result = updates.borrow_and_update().clone();
                if let Some(result) = result {
                    print_json(&result, false)?;
                }
            }
        }
    }

    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Set { key, value } => {
            if let Err(e) = config::set_config_value(&key, &value) {
                eprintln!("Error setting config: {e}");
                std::process::exit(1);
            }
        }
    }
}
