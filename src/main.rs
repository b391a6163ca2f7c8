use anyhow::{Context, Result, bail};
use autobatch::JobRequest;
use autobatch::config::{AutobatchConfig, ConfigPaths, DirectiveDefaults};
use autobatch::hpc::{SbatchRunner, Submitter};
use autobatch::params::OrderedMap;
use autobatch::script::{JobSpec, RunTemplate, ScriptAssembler, ScriptParser};
use clap::{Args, Parser, Subcommand, builder::styling};
use env_logger::Builder;
use log::{LevelFilter, debug, info};
use std::fs;
use std::path::{Path, PathBuf};

const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::Green.on_default().bold())
    .usage(styling::AnsiColor::Green.on_default().bold())
    .literal(styling::AnsiColor::Cyan.on_default().bold())
    .placeholder(styling::AnsiColor::Cyan.on_default());

#[derive(Parser)]
#[command(name = "autobatch")]
#[command(about = "Generate, submit and parse Slurm batch scripts", long_about = None)]
#[command(version)]
#[command(styles = STYLES)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "AUTOBATCH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Additional config file, applied after the standard locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the script of a job request
    Render {
        #[command(flatten)]
        job: JobArgs,

        /// Write the script here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Render a job request and submit it with sbatch
    Submit {
        #[command(flatten)]
        job: JobArgs,

        /// Submit one script per grid-search task
        #[arg(long)]
        all_tasks: bool,

        /// Save each script to this path before submitting
        #[arg(long)]
        save_script: Option<PathBuf>,

        /// Print the scripts instead of submitting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse an existing script back into directives, parameters and commands
    Parse {
        /// Script file
        script: PathBuf,

        /// Run-command template the script was rendered with
        #[arg(short, long)]
        template: String,

        /// Print the script re-rendered from the parsed job instead of JSON
        #[arg(long)]
        rebuild: bool,
    },
    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Job request file (JSON, JSON5, YAML or TOML)
    request: PathBuf,

    /// Override a parameter, e.g. `--set optim.lr=0.01` (repeatable)
    #[arg(short = 's', long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Render only this task
    #[arg(long)]
    task_id: Option<usize>,

    /// Run-command template, overriding the request's
    #[arg(short, long)]
    template: Option<String>,

    /// Value for an extra run-command placeholder (repeatable)
    #[arg(short, long = "arg", value_name = "NAME=VALUE")]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the merged configuration
    Show,
    /// List the configuration file locations
    Paths,
    /// Write a default configuration file
    Init {
        /// Destination; `autobatch.toml` in the working directory by default
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = ConfigPaths::new();
    let mut files: Vec<PathBuf> = paths.existing_paths().into_iter().cloned().collect();
    if let Some(extra) = &cli.config {
        files.push(extra.clone());
    }
    let config = AutobatchConfig::load_from_files(&files)?;
    if let Err(errors) = config.validate() {
        bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }

    init_logging(cli.log_level.as_deref().or(config.log_level.as_deref()))?;
    debug!("Loaded configuration from {:?}", files);

    match cli.command {
        Commands::Render { job, output } => render(&config, job, output.as_deref()),
        Commands::Submit {
            job,
            all_tasks,
            save_script,
            dry_run,
        } => submit(&config, job, all_tasks, save_script, dry_run),
        Commands::Parse {
            script,
            template,
            rebuild,
        } => parse(&script, &template, rebuild),
        Commands::Config { action } => handle_config_action(&config, &paths, action),
    }
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let mut builder = Builder::from_default_env();
    match level {
        Some(level) => {
            let filter: LevelFilter = level
                .parse()
                .with_context(|| format!("Invalid log level '{}'", level))?;
            builder.filter_level(filter);
        }
        None if std::env::var_os("RUST_LOG").is_none() => {
            builder.filter_level(LevelFilter::Info);
        }
        None => {}
    }
    builder.init();
    Ok(())
}

/// Load the request and build its job spec, returning the extra run arguments
fn build_job(config: &AutobatchConfig, job: &JobArgs) -> Result<(JobSpec, OrderedMap<String>)> {
    let mut request = JobRequest::from_file(&job.request)
        .with_context(|| format!("Failed to load job request {:?}", job.request))?;
    request.apply_overrides(&job.overrides)?;

    let defaults = DirectiveDefaults::from_config(&config.defaults);
    let mut builder = request.builder(&defaults);
    if let Some(template) = &job.template {
        builder = builder.run_command(RunTemplate::parse(template)?);
    }
    if job.task_id.is_some() {
        builder = builder.task_id(job.task_id);
    }
    let spec = builder.build()?;

    let mut run_args = OrderedMap::new();
    for item in &job.args {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("Run argument '{}' must look like NAME=VALUE", item))?;
        run_args.insert(key.trim(), value.to_string());
    }
    Ok((spec, run_args))
}

fn render(config: &AutobatchConfig, job: JobArgs, output: Option<&Path>) -> Result<()> {
    let (spec, run_args) = build_job(config, &job)?;
    let script = ScriptAssembler::new(&spec).with_args(&run_args).assemble()?;
    match output {
        Some(path) => {
            fs::write(path, &script)
                .with_context(|| format!("Failed to write script to {:?}", path))?;
            info!("Wrote script to {:?}", path);
        }
        None => println!("{}", script),
    }
    Ok(())
}

fn submit(
    config: &AutobatchConfig,
    job: JobArgs,
    all_tasks: bool,
    save_script: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let (spec, run_args) = build_job(config, &job)?;
    let save_path = save_script.or_else(|| {
        config.submit.save_dir.as_ref().map(|dir| {
            let stem = Path::new(spec.script_name())
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| "job".to_string());
            dir.join(format!("{}.sbatch", stem))
        })
    });
    let dry_run = dry_run || config.submit.dry_run;

    let runner = SbatchRunner::new(config.sbatch_exec.as_deref())?;
    let records = Submitter::new(&runner)
        .schedule_all_tasks(all_tasks || config.submit.schedule_all_tasks)
        .save_to(save_path)
        .dry_run(dry_run)
        .with_args(&run_args)
        .submit(&spec, spec.task_id())?;

    for record in &records {
        match &record.output {
            None => println!("{}", record.script),
            Some(output) if output.success() => print!("{}", output.stdout),
            Some(output) => bail!(
                "{} failed for task {:?} with return code {}: {}",
                runner.exec(),
                record.task_id,
                output.return_code,
                output.stderr.trim()
            ),
        }
    }
    Ok(())
}

fn parse(script: &Path, template: &str, rebuild: bool) -> Result<()> {
    let text =
        fs::read_to_string(script).with_context(|| format!("Failed to read {:?}", script))?;
    let template = RunTemplate::parse(template)?;
    let parsed = ScriptParser::new(&template)?.parse(&text)?;

    if rebuild {
        let spec = parsed.into_builder(template).build()?;
        println!("{}", spec.assemble()?);
    } else {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
    }
    Ok(())
}

fn handle_config_action(
    config: &AutobatchConfig,
    paths: &ConfigPaths,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => print!("{}", config.to_toml()?),
        ConfigAction::Paths => {
            for path in paths.all_paths() {
                let state = if path.exists() { "found" } else { "missing" };
                println!("{} ({})", path.display(), state);
            }
        }
        ConfigAction::Init { path, force } => {
            let path = path.unwrap_or_else(|| paths.local.clone());
            if path.exists() && !force {
                bail!("{:?} already exists; use --force to overwrite it", path);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, AutobatchConfig::generate_default_config())
                .with_context(|| format!("Failed to write {:?}", path))?;
            info!("Wrote default configuration to {:?}", path);
        }
    }
    Ok(())
}
