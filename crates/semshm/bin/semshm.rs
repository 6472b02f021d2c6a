//! semshm command-line front end.
//!
//! A thin wrapper around the semshm library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging (to stderr; stdout carries descriptors and payloads)
//! 3. Loads transport configuration from the environment
//! 4. Runs a single write or read
//!
//! The shell is the side channel: `write` prints a JSON descriptor that is
//! passed to `read --descriptor` in another process.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use semshm::{KeyedWriter, PathKeys, ReadDescriptor, Reader, TransportConfig, Writer};

#[derive(Debug, Parser)]
#[command(
    name = "semshm",
    about = "Hand a payload to another process through shared memory",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a file into shared memory and print its read descriptor
    Write {
        /// Addressing scheme
        #[arg(long, value_enum, default_value_t = Scheme::Keyed)]
        scheme: Scheme,

        /// Name prefix for the named scheme
        #[arg(long, env = "SEMSHM_PREFIX", default_value = "semshm")]
        prefix: String,

        /// File holding the payload
        #[arg(long)]
        input: PathBuf,

        /// Derive keyed-scheme keys from files created in this directory
        #[arg(long, env = "SEMSHM_KEY_DIR")]
        key_dir: Option<PathBuf>,
    },

    /// Read the payload a descriptor points at
    Read {
        /// Descriptor JSON as printed by `write`
        #[arg(long)]
        descriptor: String,

        /// Destination file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scheme {
    /// SystemV segment guarded by a semaphore
    Keyed,
    /// POSIX segment named `<prefix>-<size>`
    Named,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TransportConfig::from_env()?;

    match cli.command {
        Command::Write {
            scheme,
            prefix,
            input,
            key_dir,
        } => {
            let writer = match (scheme, key_dir) {
                (Scheme::Keyed, Some(dir)) => {
                    let keys = PathKeys::from_config(dir, "semshm-key-", &config);
                    Writer::Keyed(KeyedWriter::with_key_source(config, keys)?)
                }
                (Scheme::Keyed, None) => Writer::keyed(config)?,
                (Scheme::Named, _) => Writer::named(prefix, config)?,
            };
            write(&writer, &input)
        }
        Command::Read { descriptor, output } => read(&descriptor, output.as_deref()),
    }
}

fn write(writer: &Writer, input: &Path) -> Result<()> {
    let payload =
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;

    let descriptor = writer.write(&payload)?;
    tracing::info!("Wrote {}", descriptor);

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", descriptor.to_json()?)?;
    stdout.flush()?;

    // The segment lives only as long as this process holds it.
    tracing::info!("Holding resources until stdin is closed");
    let mut sink = String::new();
    let mut stdin = io::stdin().lock();
    while stdin.read_line(&mut sink)? > 0 {
        sink.clear();
    }

    writer.close()?;
    Ok(())
}

fn read(descriptor: &str, output: Option<&Path>) -> Result<()> {
    let descriptor = ReadDescriptor::from_json(descriptor)?;
    let reader = Reader::new();
    let payload = reader.read(&descriptor)?;
    reader.close()?;
    tracing::info!("Read {}", descriptor);

    match output {
        Some(path) => std::fs::write(path, &payload)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&payload)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
