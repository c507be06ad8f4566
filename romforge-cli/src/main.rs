use clap::Parser;
use log::{error, info, warn, LevelFilter};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use romforge_core::events::SpaceEvents;
use romforge_core::image::BoardTarget;
use romforge_core::symbols::SymbolTable;
use romforge_core::{LoadOptions, RomError, RomImage, Settings};

#[derive(Debug, Parser)]
#[command(
    name = "RomForge-CLI",
    version,
    about = "Write board events and cheats into Mario Party images"
)]
struct Args {
    #[arg(long)]
    input: PathBuf,

    #[arg(long, required_unless_present = "info")]
    output: Option<PathBuf>,

    /// Symbol table, `{ "NMWE": [{ "name": ..., "addr": ... }] }`.
    #[arg(long)]
    symbols: Option<PathBuf>,

    /// Directory searched for `.asm` / `.s` custom events.
    #[arg(long, value_name = "DIR")]
    events_dir: Option<PathBuf>,

    /// Raw machine code run every frame. May be repeated.
    #[arg(long = "cheat", value_name = "FILE")]
    cheats: Vec<PathBuf>,

    /// Settings JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON list of `{ "target": {...}, "spaces": [...] }` boards to write.
    #[arg(long, value_name = "PLAN")]
    board_events: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    allow_unsupported: bool,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Debug-only: print what was detected and exit without saving.
    #[arg(long, hide = true)]
    info: bool,
}

#[derive(Debug, Deserialize)]
struct BoardPlan {
    target: BoardTarget,
    spaces: Vec<SpaceEvents>,
}

fn init_logging(verbose: bool) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .chain(std::io::stderr())
        .apply()
}

fn custom_event_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("asm") | Some("s")
            )
        })
        .collect();
    files.sort();
    files
}

fn print_info(image: &RomImage) {
    match image.game() {
        Some(game) => println!("game:       {game}"),
        None => println!("game:       unknown ('{}')", image.id()),
    }
    println!("byte order: {}", image.byte_order());
    println!("size:       {:#X}", image.bytes().len());
    println!("events:     {}", image.events().len());
    for section in image.sections() {
        println!(
            "  {:<22} {:#010X} {:#X} bytes",
            section.kind.name(),
            section.offset,
            section.len
        );
    }
}

fn run(args: Args) -> Result<(), RomError> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_json_str(&fs::read_to_string(path)?)?,
        None => Settings::default(),
    };
    settings.allow_unsupported |= args.allow_unsupported;

    let mut options = LoadOptions::new(settings);
    if let Some(path) = &args.symbols {
        options.symbols = Arc::new(SymbolTable::from_json_str(&fs::read_to_string(path)?)?);
    }

    let bytes = fs::read(&args.input)?;
    let mut image = RomImage::load_with(&bytes, options)?;

    if let Some(dir) = &args.events_dir {
        for path in custom_event_files(dir) {
            let text = fs::read_to_string(&path)?;
            match image.register_custom_event(&text) {
                Ok(()) => info!("registered custom event from {}", path.display()),
                Err(err) => error!("{}: {err}", path.display()),
            }
        }
    }

    if args.info {
        print_info(&image);
        return Ok(());
    }

    if let Some(path) = &args.board_events {
        let plans: Vec<BoardPlan> = serde_json::from_str(&fs::read_to_string(path)?)?;
        for mut plan in plans {
            let report = image.write_board_events(&plan.target, &mut plan.spaces)?;
            for failure in &report.failures {
                warn!(
                    "space {}: event {} skipped: {}",
                    failure.space, failure.event, failure.error
                );
            }
            info!(
                "board in file {}/{}: table at {:#X}",
                plan.target.dir, plan.target.file, report.table_address
            );
        }
    }

    for path in &args.cheats {
        image.stage_cheat(fs::read(path)?)?;
    }

    let out = image.save()?;
    // Clap enforces --output unless --info, which returned above.
    let output = args
        .output
        .ok_or_else(|| RomError::Config("--output is required".to_string()))?;
    fs::write(&output, out)?;
    info!("wrote {}", output.display());
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = init_logging(args.verbose) {
        eprintln!("Failed to set up logging: {err}");
    }

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
