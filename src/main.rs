use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use blockpak::errors::EngineError;
use blockpak::ui;

#[derive(Debug, Parser)]
#[command(name = "blockpak", about = "Content-addressed block storage engine")]
struct Cli {
    /// Verbosity (-v, -vv, -vvv, ...). Warn by default.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the repository directory.
    #[arg(short, long)]
    repository: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new, empty repository.
    Init {
        #[arg(long, default_value = "ENCRYPTED_HMAC_SHA256_AES256_CTR")]
        object_format: String,
        #[arg(long, default_value_t = 1 << 20)]
        max_inline_content_length: u32,
        #[arg(long, default_value_t = 20 * 1024 * 1024)]
        max_block_size: u32,
    },
    /// Block-level operations against an existing repository.
    Block {
        #[command(subcommand)]
        command: BlockCommand,
    },
}

#[derive(Debug, Subcommand)]
enum BlockCommand {
    Write(ui::write::Args),
    Read(ui::read::Args),
    List(ui::list::Args),
    Compact(ui::compact::Args),
    Flush(ui::flush::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let password = match read_password() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("{e:?}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Init {
            object_format,
            max_inline_content_length,
            max_block_size,
        } => blockpak::formatter::format_requires_master_key(&object_format).and_then(|needs_master_key| {
            ui::init_repository(
                &cli.repository,
                &password,
                &object_format,
                max_inline_content_length,
                max_block_size,
                needs_master_key,
            )
        }),
        Command::Block { command } => match command {
            BlockCommand::Write(args) => ui::write::run(&cli.repository, &password, args),
            BlockCommand::Read(args) => ui::read::run(&cli.repository, &password, args),
            BlockCommand::List(args) => ui::list::run(&cli.repository, &password, args),
            BlockCommand::Compact(args) => ui::compact::run(&cli.repository, &password, args),
            BlockCommand::Flush(args) => ui::flush::run(&cli.repository, &password, args),
        },
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(e @ EngineError::IntegrityError { .. }) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// `BLOCKPAK_PASSWORD`, or (for interactive use) a single line from stdin.
/// A richer credential story belongs to a higher-level CLI built on this
/// engine; the thin `block` surface this binary exposes only needs to get a
/// password into [`blockpak::config::FormatHeader::unseal`].
fn read_password() -> anyhow::Result<Vec<u8>> {
    use anyhow::Context;
    use std::io::BufRead;

    if let Ok(p) = std::env::var("BLOCKPAK_PASSWORD") {
        return Ok(p.into_bytes());
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Couldn't read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).as_bytes().to_vec())
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}
