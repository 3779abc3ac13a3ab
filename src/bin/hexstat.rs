use clap::{Parser, Subcommand};
use hexstat::lens::aggregate::AggregateArgs;
use hexstat::lens::utils::OutputFormat;
use hexstat::HexstatConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.hexstat/hexstat.toml is used
    #[clap(short, long, global = true)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    /// Output format: table, markdown, json, json-pretty, json-line, psv
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one month's archive and store its records
    Ingest(commands::ingest::IngestArgs),

    /// Aggregate stored records into hex cells inside a bounding box
    Aggregate(AggregateArgs),

    /// List ingestion runs
    Runs(commands::runs::RunsArgs),

    /// Hex grid lookups
    Hex {
        #[clap(subcommand)]
        commands: commands::hex::HexCommands,
    },

    /// Show configuration and database status
    Config(commands::config::ConfigArgs),
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.debug { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match HexstatConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let output_format = cli.format;

    match cli.command {
        Commands::Ingest(args) => commands::ingest::run(&config, args, output_format),
        Commands::Aggregate(args) => commands::aggregate::run(&config, args, output_format),
        Commands::Runs(args) => commands::runs::run(&config, args, output_format),
        Commands::Hex { commands } => commands::hex::run(commands, output_format),
        Commands::Config(args) => commands::config::run(&config, args, output_format),
    }
}
