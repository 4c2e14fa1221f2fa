use anyhow::Result;
use std::path::PathBuf;

use modelvault::config::Config;
use modelvault::db::AssetRepository;
use modelvault::logging;
use modelvault::scan::{self, ScanOptions};
use modelvault::service::AssetService;

struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

enum Command {
    Init,
    ScanFolder(PathBuf),
    ScanLibrary,
    List,
    Tags,
    Prune,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut scan_library = false;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("modelvault {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--library" => {
                scan_library = true;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        Some("init") => Command::Init,
        Some("scan") => {
            if scan_library {
                Command::ScanLibrary
            } else if let Some(folder) = positional.get(1) {
                Command::ScanFolder(PathBuf::from(folder))
            } else {
                eprintln!("Error: scan needs a folder argument or --library");
                std::process::exit(1);
            }
        }
        Some("list") => Command::List,
        Some("tags") => Command::Tags,
        Some("prune") => Command::Prune,
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    CliArgs {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"modelvault - metadata store for a 3D-printable asset library

USAGE:
    modelvault [OPTIONS] <COMMAND>

COMMANDS:
    init               Create the database and default config
    scan <FOLDER>      Reconcile one container folder
    scan --library     Reconcile every container under the library root
    list               List stored assets
    tags               List stored tags
    prune              Remove assets whose backing files are gone

OPTIONS:
    --config, -c PATH  Path to config file
    --version, -V      Show version
    --help, -h         Show this help message

ENVIRONMENT:
    MODELVAULT_LIBRARY_PATH  Overrides the configured library root
    MODELVAULT_LOG           Log level (trace, debug, info, warn, error)"#
    );
}

fn scan_options(config: &Config) -> ScanOptions {
    ScanOptions {
        model_extensions: config.scanner.model_extensions.clone(),
        ..ScanOptions::default()
    }
}

fn main() -> Result<()> {
    let args = parse_args();

    // Logging failures must not take the CLI down
    let _ = logging::init(None);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Opening the repository creates the database and schema when missing
    let repository = AssetRepository::open(&config.db_path)?;
    let service = AssetService::new(repository);

    match args.command {
        Command::Init => {
            println!("Database ready at {}", config.db_path.display());
            println!("Library root: {}", config.library.root.display());
        }
        Command::ScanFolder(folder) => {
            let canonical = std::fs::canonicalize(&folder)?;
            let existing = service.get_asset_by_path(&canonical.display().to_string())?;
            let outcome = scan::scan_container_folder(
                &service,
                &canonical,
                existing.as_ref(),
                &scan_options(&config),
            )?;
            match outcome {
                Some(outcome) => println!(
                    "Reconciled {} ({} components)",
                    outcome.folder.display(),
                    outcome.component_count
                ),
                None => println!(
                    "Skipped {}: folder name is not a container UUID",
                    folder.display()
                ),
            }
        }
        Command::ScanLibrary => {
            let outcomes =
                scan::scan_library_root(&service, &config.library.root, &scan_options(&config))?;
            println!(
                "Reconciled {} container(s) under {}",
                outcomes.len(),
                config.library.root.display()
            );
            for outcome in outcomes {
                println!(
                    "  {} ({} components)",
                    outcome.folder.display(),
                    outcome.component_count
                );
            }
        }
        Command::List => {
            let assets = service.list_assets()?;
            if assets.is_empty() {
                println!("No assets stored.");
            }
            for asset in assets {
                if asset.tags.is_empty() {
                    println!("{:>5}  {}", asset.id, asset.path);
                } else {
                    println!("{:>5}  {}  [{}]", asset.id, asset.path, asset.tags.join(", "));
                }
            }
        }
        Command::Tags => {
            let tags = service.all_tags()?;
            if tags.is_empty() {
                println!("No tags stored.");
            }
            for tag in tags {
                println!("{tag}");
            }
        }
        Command::Prune => {
            let removed = service.prune_missing_assets(Some(&config.library.root))?;
            println!("Pruned {} asset(s) with no backing file", removed.len());
            for asset in removed {
                println!("  {}", asset.path);
            }
        }
    }

    Ok(())
}
