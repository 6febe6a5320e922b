use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use report_pipeline::cache::MemoryCache;
use report_pipeline::config::{ConfigLoader, ReportConfig};
use report_pipeline::error::{ErrorKind, ReportError};
use report_pipeline::output::{JsonOutput, OutputMode, TextOutput};
use report_pipeline::redash::RedashHttpClient;
use report_pipeline::report::ReportPipeline;
use report_pipeline::workbook::Workbook;

#[derive(Parser)]
#[command(name = "report-pipeline")]
#[command(about = "Fill a dated copy of an xlsx report template with Redash query results")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Generate the report artifact")]
    Run(RunArgs),
    #[command(about = "List the queries of the configured report")]
    Queries(ConfigArgs),
    #[command(about = "List the sheets of the report template")]
    Sheets(SheetsArgs),
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    template: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    strict: bool,

    #[arg(long, help = "Report date (YYYY-MM-DD), defaults to today")]
    date: Option<NaiveDate>,
}

#[derive(Args, Clone)]
struct SheetsArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    template: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<ReportError>() {
                return ExitCode::from(map_exit_code(err.kind()));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::ConfigError => 2,
        ErrorKind::FetchError => 3,
        ErrorKind::ShapeError | ErrorKind::TemplateMissing | ErrorKind::InjectionError => 4,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_report(args, output_mode),
        Commands::Queries(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_registry(&config.registry).into_diagnostic()?
                }
                OutputMode::Interactive => {
                    TextOutput::print_registry(&config.registry).into_diagnostic()?
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sheets(args) => {
            let config = ConfigLoader::resolve(args.config.config.as_deref())?;
            let template = args.template.unwrap_or(config.template);
            let workbook = Workbook::open(&template)?;
            let sheets = workbook.sheet_names();
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_sheets(&sheets).into_diagnostic()?,
                OutputMode::Interactive => {
                    for sheet in sheets {
                        let used = config.registry.sheets().contains(sheet);
                        println!("{}{sheet}", if used { "* " } else { "  " });
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_report(args: RunArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let mut config: ReportConfig = ConfigLoader::resolve(args.config.config.as_deref())?;
    if let Some(template) = args.template {
        config.template = template;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if args.strict {
        config.strict_sheets = true;
    }

    let client = RedashHttpClient::new(&config.base_url, config.timeout)?;
    let pipeline = ReportPipeline::from_config(&config, client, Arc::new(MemoryCache::new()));
    let report_date = args.date.unwrap_or_else(|| Local::now().date_naive());

    let outcome = match output_mode {
        OutputMode::NonInteractive => {
            let outcome = pipeline.generate_with(report_date, &JsonOutput);
            JsonOutput::print_outcome(&outcome).into_diagnostic()?;
            outcome
        }
        OutputMode::Interactive => {
            let outcome = pipeline.generate_with(report_date, &TextOutput);
            TextOutput::print_outcome(&outcome).into_diagnostic()?;
            outcome
        }
    };

    Ok(match outcome.error_kind {
        Some(kind) if !outcome.success => ExitCode::from(map_exit_code(kind)),
        _ => ExitCode::SUCCESS,
    })
}
