use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Command line options available through the `holotree` cli.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// The subcommand to execute
    #[clap(subcommand)]
    command: Command,

    /// Log verbose
    #[clap(short, long, global = true)]
    verbose: bool,
}

/// Different commands supported by `holotree`.
#[derive(Debug, clap::Subcommand)]
enum Command {
    Init(commands::init::Opt),
    Build(commands::build::Opt),
    Restore(commands::restore::Opt),
    List(commands::list::Opt),
    Delete(commands::delete::Opt),
    Cleanup(commands::cleanup::Opt),
    Verify(commands::verify::Opt),
    Export(commands::export::Opt),
    Import(commands::import::Opt),
    RunBundle(commands::run_bundle::Opt),
    Sbom(commands::sbom::Opt),
}

/// Entry point of the `holotree` cli.
fn main() -> miette::Result<()> {
    // Parse the command line arguments
    let opt = Opt::parse();

    // Determine the logging level based on the verbose flag and the RUST_LOG
    // environment variable.
    let default_filter = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;

    // Setup the tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    // Dispatch the selected command
    match opt.command {
        Command::Init(opt) => commands::init::execute(opt),
        Command::Build(opt) => commands::build::execute(opt),
        Command::Restore(opt) => commands::restore::execute(opt),
        Command::List(opt) => commands::list::execute(opt),
        Command::Delete(opt) => commands::delete::execute(opt),
        Command::Cleanup(opt) => commands::cleanup::execute(opt),
        Command::Verify(opt) => commands::verify::execute(opt),
        Command::Export(opt) => commands::export::execute(opt),
        Command::Import(opt) => commands::import::execute(opt),
        Command::RunBundle(opt) => commands::run_bundle::execute(opt),
        Command::Sbom(opt) => commands::sbom::execute(opt),
    }
}
