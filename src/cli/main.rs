use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exif_caption::caption::{BlipCaptioner, download_model};
use exif_caption::exif::{self, Section};
use exif_caption::{config, pipeline, server};

#[derive(Parser, Debug)]
#[command(
    name = "exif-caption",
    version,
    about = "Caption images with a local BLIP model and store the caption in EXIF ImageDescription"
)]
struct Cli {
    /// Image files or directories to caption
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run the HTTP server (POST /generate-caption)
    #[arg(long)]
    serve: bool,

    /// Override the configured listen host
    #[arg(long, requires = "serve")]
    host: Option<String>,

    /// Override the configured listen port
    #[arg(long, requires = "serve")]
    port: Option<u16>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Print captions without writing them into the files
    #[arg(long)]
    dry_run: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Display existing EXIF metadata and exit
    #[arg(long = "show-exif")]
    show_exif: bool,

    /// Download the BLIP model and tokenizer and exit
    #[arg(long = "download-model")]
    download_model: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = config::Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => config::Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    let mut config = config::Config::load(cli.config.as_deref())?;

    // Handle --download-model
    if cli.download_model {
        println!("Downloading BLIP model...");
        let dir = download_model(config.model.model_dir.as_deref()).await?;
        println!("Model downloaded to: {}", dir.display());
        return Ok(());
    }

    // Handle --show-exif
    if cli.show_exif {
        let images = collect(&cli.paths)?;
        for image_path in &images {
            print_exif(image_path)?;
        }
        return Ok(());
    }

    if !cli.serve && cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    // Collect before loading the model so a bad path fails fast
    let images = if cli.serve {
        Vec::new()
    } else {
        collect(&cli.paths)?
    };

    let model_dir = config.model.resolve_dir()?;
    let captioner = BlipCaptioner::load(
        &model_dir,
        config.model.force_cpu,
        config.model.max_tokens(),
    )?;

    // Handle --serve
    if cli.serve {
        if let Some(host) = cli.host {
            config.server.host = host;
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        return server::serve(config, Arc::new(captioner)).await;
    }

    let embed = config.metadata.embed_caption && !cli.dry_run;
    log::info!("Found {} image(s) to caption", images.len());
    if !embed {
        log::info!("DRY RUN: no files will be modified");
    }

    let mut rows = Vec::new();
    let total = images.len();

    for (i, image_path) in images.iter().enumerate() {
        log::info!("[{}/{}] Captioning: {}", i + 1, total, image_path.display());

        let row = match pipeline::caption_file(image_path, &captioner, embed).await {
            Ok(outcome) => {
                log::info!("  Caption: {}", outcome.caption);
                serde_json::json!({
                    "path": image_path.display().to_string(),
                    "caption": outcome.caption,
                    "embedded": outcome.embedded,
                    "error": null,
                })
            }
            Err(e) => {
                log::error!("  Error: {e}");
                serde_json::json!({
                    "path": image_path.display().to_string(),
                    "caption": null,
                    "embedded": false,
                    "error": e.to_string(),
                })
            }
        };
        rows.push(row);
    }

    // JSON output
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }

    let failed = rows.iter().filter(|r| !r["error"].is_null()).count();
    log::info!(
        "Done: {} succeeded, {failed} failed out of {total} images",
        total - failed
    );

    Ok(())
}

fn collect(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let images = pipeline::collect_images(paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }
    Ok(images)
}

// ANSI color codes
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Print the EXIF summary and the per-section field counts for a file.
fn print_exif(path: &Path) -> Result<()> {
    let data = exif::read_exif(path)?;

    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("{DIM}{}{RESET}", "═".repeat(72));

    let mut any = false;
    for (tag, val) in [
        ("ImageDescription", data.description.as_deref()),
        ("Make", data.make.as_deref()),
        ("Model", data.model.as_deref()),
    ] {
        if let Some(v) = val {
            print_row(tag, v);
            any = true;
        }
    }
    if let (Some(lat), Some(lon)) = (data.gps_latitude, data.gps_longitude) {
        print_row("GPSLatitude", &format!("{lat:.6}"));
        print_row("GPSLongitude", &format!("{lon:.6}"));
        any = true;
    }

    match exif::read_container(path) {
        Ok(Some(container)) => {
            println!("  {DIM}{}{RESET}", "─".repeat(70));
            for section in Section::ALL {
                let count = container.section(section).len();
                if count > 0 {
                    print_row(section.name(), &format!("{count} field(s)"));
                }
            }
            if let Some(thumb) = container.thumbnail() {
                print_row("Thumbnail", &format!("{} bytes", thumb.len()));
            }
            any = true;
        }
        Ok(None) => {}
        Err(e) => log::warn!("Cannot parse EXIF block of {}: {e}", path.display()),
    }

    if !any {
        println!("  {DIM}(no EXIF metadata found){RESET}");
    }
    println!();

    Ok(())
}

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print a single row in the EXIF display table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
