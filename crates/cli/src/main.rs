//! `wt`: command-line utility for cellar databases.
//!
//! # Usage
//!
//! ```bash
//! # Dump a table in printable form, then load it under a new name
//! wt -h /var/db dump -p table:users > users.dump
//! wt -h /var/db load -f users.dump -r users_copy
//!
//! # Insert two rows, overwriting existing keys
//! wt -h /var/db write -o table:users alice admin bob guest
//!
//! # Print the log with user data, from file 3 onwards
//! wt -h /var/db printlog -u -l 3
//!
//! # Copy a hot backup
//! wt -h /var/db backup /backups/today
//! ```
//!
//! Failures print the error (with its reserved code name, when it has one)
//! to stderr and exit nonzero.

mod dump;
mod error;
mod format;
mod load;
mod ops;
mod printlog;

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, IsTerminal, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use cellar_store::Connection;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use error::{CliError, FileSnafu, Result};
use format::DumpStyle;
use load::LoadOptions;
use ops::WriteMode;
use printlog::FileRange;
use snafu::ResultExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// JSON when stderr is not a terminal, text otherwise.
    Auto,
    /// Human-readable text.
    Text,
    /// One JSON object per line.
    Json,
}

/// Inspect, dump, load and maintain cellar databases.
#[derive(Debug, Parser)]
#[command(name = "wt", version, disable_help_flag = true)]
struct Cli {
    /// Database home directory.
    #[arg(short = 'h', long = "home", default_value = ".", global = true)]
    home: PathBuf,

    /// Extra connection configuration.
    #[arg(short = 'C', long = "config", global = true)]
    config: Option<String>,

    /// Run log recovery when opening.
    #[arg(short = 'R', long = "recover", global = true)]
    recover: bool,

    /// Log debug detail.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Auto, global = true)]
    log_format: LogFormat,

    /// Print help.
    #[arg(long, action = ArgAction::Help, global = true)]
    help: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dump an object's configuration and rows.
    #[command(disable_help_flag = true)]
    Dump {
        /// Hex encoding.
        #[arg(short = 'x')]
        hex: bool,
        /// JSON output.
        #[arg(short = 'j')]
        json: bool,
        /// Printable output (with -x: printable keys, hex values).
        #[arg(short = 'p')]
        print: bool,
        /// Output file (default stdout).
        #[arg(short = 'f')]
        output: Option<PathBuf>,
        /// Object to dump.
        uri: String,
    },
    /// Load objects from a dump.
    #[command(disable_help_flag = true)]
    Load {
        /// The input is a JSON dump.
        #[arg(short = 'j')]
        json: bool,
        /// Input file (default stdin).
        #[arg(short = 'f')]
        input: Option<PathBuf>,
        /// Load under this object name.
        #[arg(short = 'r')]
        rename: Option<String>,
        /// Allocate new record numbers in column stores.
        #[arg(short = 'a')]
        append: bool,
    },
    /// List objects.
    #[command(disable_help_flag = true)]
    List {
        /// Show each object's configuration.
        #[arg(short = 'c', long = "show-config")]
        show_config: bool,
        /// Only objects whose URI starts with this.
        uri: Option<String>,
    },
    /// Verify an object.
    #[command(disable_help_flag = true)]
    Verify {
        /// Extra output: dump_address or dump_pages (repeatable).
        #[arg(short = 'd')]
        dump: Vec<String>,
        /// Object to verify.
        uri: String,
    },
    /// Print the write-ahead log.
    #[command(disable_help_flag = true)]
    Printlog {
        /// Print user keys and values instead of redacting them.
        #[arg(short = 'u')]
        user_data: bool,
        /// Hex encoding of keys and values.
        #[arg(short = 'x')]
        hex: bool,
        /// Log files to print: start[,stop].
        #[arg(short = 'l')]
        range: Option<String>,
        /// Output file (default stdout).
        #[arg(short = 'f')]
        output: Option<PathBuf>,
    },
    /// Write or remove rows.
    #[command(disable_help_flag = true)]
    Write {
        /// Overwrite existing keys.
        #[arg(short = 'o', conflicts_with = "remove")]
        overwrite: bool,
        /// Remove the listed keys.
        #[arg(short = 'r')]
        remove: bool,
        /// Object to change.
        uri: String,
        /// Key/value pairs, or keys with -r.
        #[arg(required = true)]
        args: Vec<String>,
    },
    /// Copy a hot backup into a directory.
    #[command(disable_help_flag = true)]
    Backup {
        /// Destination directory.
        dest: PathBuf,
    },
    /// Compact an object, or every object.
    #[command(disable_help_flag = true)]
    Compact {
        /// Object to compact.
        uri: Option<String>,
    },
}

fn init_logging(cli: &Cli) {
    let default = if cli.verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let use_json = match cli.log_format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !io::stderr().is_terminal(),
    };
    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false).with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer().with_writer(io::stderr)).init();
    }
}

fn connection_config(cli: &Cli, command: &Command) -> String {
    let mut parts = Vec::new();
    if matches!(command, Command::Load { .. } | Command::Write { .. }) {
        parts.push("create".to_string());
    }
    if cli.recover {
        parts.push("log=(enabled=true,recover=on)".to_string());
    }
    parts.extend(cli.config.clone());
    parts.join(",")
}

fn output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path).context(FileSnafu { path })?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn run(cli: &Cli) -> Result<()> {
    // printlog reads files directly and works on a home nobody can open.
    if let Command::Printlog { user_data, hex, range, output: path } = &cli.command {
        let range = range.as_deref().map(FileRange::parse).transpose()?;
        let mut out = output(path.as_deref())?;
        printlog::print_log(&cli.home, range, *hex, *user_data, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    let conn = Connection::open(&cli.home, &connection_config(cli, &cli.command))?;
    let session = conn.open_session("")?;
    match &cli.command {
        Command::Dump { hex, json, print, output: path, uri } => {
            let mut out = output(path.as_deref())?;
            if *json {
                if *hex || *print {
                    return Err(CliError::Usage { message: "dump: -j cannot be combined with -p or -x".into() });
                }
                dump::dump_json(&session, uri, &mut out)?;
            } else {
                let style = match (*print, *hex) {
                    (true, true) => DumpStyle::PrintHex,
                    (false, true) => DumpStyle::Hex,
                    _ => DumpStyle::Print,
                };
                dump::dump_text(&session, uri, style, &mut out)?;
            }
            out.flush()?;
        },
        Command::Load { json, input, rename, append } => {
            let opts = LoadOptions { rename: rename.clone(), append: *append };
            let reader: Box<dyn io::BufRead> = match input {
                Some(path) => Box::new(BufReader::new(File::open(path).context(FileSnafu { path })?)),
                None => Box::new(io::stdin().lock()),
            };
            if *json {
                let doc: serde_json::Value = serde_json::from_reader(reader)?;
                load::load_json(&session, &doc, &opts)?;
            } else {
                load::load_text(&session, reader, &opts)?;
            }
        },
        Command::List { show_config, uri } => {
            let mut out = output(None)?;
            ops::list(&session, uri.as_deref(), *show_config, &mut out)?;
            out.flush()?;
        },
        Command::Verify { dump, uri } => {
            let mut out = output(None)?;
            ops::verify(&session, uri, dump, &mut out)?;
            out.flush()?;
        },
        Command::Write { overwrite, remove, uri, args } => {
            let mode = match (*remove, *overwrite) {
                (true, _) => WriteMode::Remove,
                (false, true) => WriteMode::Overwrite,
                (false, false) => WriteMode::Insert,
            };
            ops::write(&session, uri, mode, args)?;
        },
        Command::Backup { dest } => {
            ops::backup(&session, &cli.home, dest)?;
        },
        Command::Compact { uri } => {
            ops::compact(&session, uri.as_deref())?;
        },
        Command::Printlog { .. } => {},
    }
    drop(session);
    conn.close("")?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.code_name() {
                Some(_) => eprintln!("wt: {e}"),
                None => eprintln!("wt: error: {e}"),
            }
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_combined_short_flags() {
        let cli = Cli::try_parse_from(["wt", "-h", "/db", "dump", "-px", "table:t"]).unwrap();
        assert_eq!(cli.home, PathBuf::from("/db"));
        let Command::Dump { hex, print, json, .. } = cli.command else { panic!("expected dump") };
        assert!(hex && print && !json);

        let cli = Cli::try_parse_from(["wt", "load", "-jf", "dump.json", "-r", "copy"]).unwrap();
        let Command::Load { json, input, rename, append } = cli.command else { panic!("expected load") };
        assert!(json && !append);
        assert_eq!(input, Some(PathBuf::from("dump.json")));
        assert_eq!(rename.as_deref(), Some("copy"));
    }

    #[test]
    fn test_write_flags() {
        assert!(Cli::try_parse_from(["wt", "write", "-o", "-r", "table:t", "k"]).is_err());
        let cli = Cli::try_parse_from(["wt", "write", "-r", "table:t", "k1", "k2"]).unwrap();
        let Command::Write { remove, args, .. } = cli.command else { panic!("expected write") };
        assert!(remove);
        assert_eq!(args, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn test_list_config_flag_does_not_shadow_connection_config() {
        let cli = Cli::try_parse_from(["wt", "list", "-c", "--config", "cache_size=1MB", "table:"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("cache_size=1MB"));
        let Command::List { show_config, uri } = cli.command else { panic!("expected list") };
        assert!(show_config);
        assert_eq!(uri.as_deref(), Some("table:"));

        let cli = Cli::try_parse_from(["wt", "list", "--show-config"]).unwrap();
        assert!(matches!(cli.command, Command::List { show_config: true, .. }));
    }

    #[test]
    fn test_connection_config_adds_create_for_writers() {
        let cli = Cli::try_parse_from(["wt", "-R", "-C", "cache_size=50MB", "write", "table:t", "k", "v"]).unwrap();
        assert_eq!(connection_config(&cli, &cli.command), "create,log=(enabled=true,recover=on),cache_size=50MB");
        let cli = Cli::try_parse_from(["wt", "list"]).unwrap();
        assert_eq!(connection_config(&cli, &cli.command), "");
    }
}
