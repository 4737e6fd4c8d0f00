use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use wikimigrator_core::bookstack::{BookStackClient, BookStackDestination, delete_all_books};
use wikimigrator_core::config::{MigrationConfig, load_config};
use wikimigrator_core::dokuwiki::{DokuWikiClient, DokuWikiMirror, SourceApi};
use wikimigrator_core::migrator::{Destination, MigrationReport, Migrator};
use wikimigrator_core::progress::{load_progress, save_progress};
use wikimigrator_core::sequencer::public_permission;
use wikimigrator_core::wikijs::{WikiJsClient, WikiJsDestination, delete_all_pages};

#[derive(Debug, Parser)]
#[command(
    name = "wikimigrator",
    version,
    about = "Incremental DokuWiki migration to BookStack, Wiki.js or another DokuWiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = "wikimigrator.toml")]
    config: PathBuf,
    #[arg(long, global = true, help = "Print the migration report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show the source identity and every page with its history and visibility")]
    Check,
    #[command(about = "Migrate into BookStack")]
    Bookstack(DestinationArgs),
    #[command(about = "Migrate into Wiki.js")]
    Wikijs(DestinationArgs),
    #[command(about = "Mirror into another DokuWiki")]
    Dokuwiki(MirrorArgs),
}

#[derive(Debug, Args)]
struct DestinationArgs {
    #[command(subcommand)]
    command: DestinationCommand,
}

#[derive(Debug, Subcommand)]
enum DestinationCommand {
    Migrate(MigrateArgs),
    #[command(about = "Delete all content on the destination")]
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct MirrorArgs {
    #[command(subcommand)]
    command: MirrorCommand,
}

#[derive(Debug, Subcommand)]
enum MirrorCommand {
    Migrate(MigrateArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, value_name = "PATH", help = "Progress file (default: <destination>-progress.toml)")]
    progress: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ResetArgs {
    #[arg(long, help = "Confirm deleting everything on the destination")]
    yes: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check => run_check(&config),
        Commands::Bookstack(DestinationArgs { command }) => {
            let settings = config.http_settings();
            let client = BookStackClient::new(&config.bookstack()?, settings)?;
            match command {
                DestinationCommand::Migrate(args) => {
                    let mut destination = BookStackDestination::new(client);
                    run_migrate(&config, &mut destination, args, cli.json)
                }
                DestinationCommand::Reset(args) => {
                    let mut client = client;
                    confirm_reset(&args, "every BookStack book")?;
                    let deleted = delete_all_books(&mut client)?;
                    println!("deleted_books: {deleted}");
                    Ok(())
                }
            }
        }
        Commands::Wikijs(DestinationArgs { command }) => {
            let wikijs = config.wikijs()?;
            let client = WikiJsClient::new(&wikijs, config.http_settings())?;
            match command {
                DestinationCommand::Migrate(args) => {
                    let mut destination =
                        WikiJsDestination::new(client, &wikijs.locale, &wikijs.editor);
                    run_migrate(&config, &mut destination, args, cli.json)
                }
                DestinationCommand::Reset(args) => {
                    let mut client = client;
                    confirm_reset(&args, "every Wiki.js page")?;
                    let deleted = delete_all_pages(&mut client)?;
                    println!("deleted_pages: {deleted}");
                    Ok(())
                }
            }
        }
        Commands::Dokuwiki(MirrorArgs {
            command: MirrorCommand::Migrate(args),
        }) => {
            let target = DokuWikiClient::new(&config.mirror()?, config.http_settings())?;
            let mut destination = DokuWikiMirror::new(target);
            run_migrate(&config, &mut destination, args, cli.json)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_check(config: &MigrationConfig) -> Result<()> {
    let mut source = DokuWikiClient::new(&config.source()?, config.http_settings())?;
    let identity = source.who_am_i()?;
    println!("source: {}", source.base_url());
    println!("user: {}", identity.login);
    println!("name: {}", identity.name);
    println!("groups: {}", identity.groups.join(", "));

    let pages = source.list_pages()?;
    println!("pages: {}", pages.len());
    for page in &pages {
        let history = source.get_page_history(&page.id)?;
        let permission = public_permission(&mut source, &page.id)?;
        println!(
            "{}: revision={} history={} public_permission={}",
            page.id,
            page.revision,
            history.len(),
            permission
        );
    }
    println!("requests: {}", source.request_count());
    Ok(())
}

fn run_migrate<D: Destination>(
    config: &MigrationConfig,
    destination: &mut D,
    args: MigrateArgs,
    json: bool,
) -> Result<()> {
    let progress_path = args.progress.unwrap_or_else(|| {
        PathBuf::from(format!("{}-progress.toml", destination.kind().as_str()))
    });
    let mut source = DokuWikiClient::new(&config.source()?, config.http_settings())?;
    let mut progress = load_progress(&progress_path)?;
    if progress.is_empty() {
        info!(
            path = %normalize_path(&progress_path),
            "no previous progress, starting a fresh migration"
        );
    }
    println!("destination: {}", destination.kind().as_str());
    println!("progress: {}", normalize_path(&progress_path));
    println!("known_pages: {}", progress.pages.len());

    let mut migrator = Migrator::new(
        &mut source,
        destination,
        &mut progress,
        config.sequencer_options(),
    );
    let outcome = migrator.migrate();
    let report = migrator.report().clone();

    let saved = save_progress(&progress_path, &progress);
    if let Err(save_error) = &saved {
        error!("failed to save progress: {save_error:#}");
    }
    print_report(&report, json)?;
    outcome?;
    saved
}

fn print_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("units: {}", report.units);
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("skipped: {}", report.skipped);
    println!("containers_created: {}", report.containers_created);
    println!("media_uploaded: {}", report.media_uploaded);
    println!("media_reused: {}", report.media_reused);
    println!("source_requests: {}", report.source_requests);
    println!("destination_requests: {}", report.destination_requests);
    Ok(())
}

fn confirm_reset(args: &ResetArgs, target: &str) -> Result<()> {
    if !args.yes {
        bail!("refusing to delete {target} without --yes");
    }
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
