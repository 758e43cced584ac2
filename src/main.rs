use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use openplugin::{
    config::{Config, ConfigManager, EnvConfigManager},
    function::Functions,
    http::ReqwestHttp,
    logger::{LogConfig, LogLevel, TelemetryHandle, init_tracing},
    pipeline::{Pipeline, PipelineError, PipelineInput, PipelineRequest},
    plugin::{OperationKey, PluginLoader},
    processor::ProcessorContext,
    provider::{ProviderKind, ProviderSettings, build_provider},
    schema::write_schema,
};
use std::{path::PathBuf, process, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "openplugin",
    about = "Run OpenAPI plugins from natural-language prompts",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one prompt through a plugin
    Run(RunArgs),

    /// Print the function schemas compiled from a plugin
    Functions(FunctionsArgs),

    /// Emit JSON-Schema for the manifest and the pipeline response
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Manifest URL or local path
    #[arg(long)]
    plugin: String,

    /// `.env` file with OPENAI_API_KEY and friends
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318); file logs when absent
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Text prompt
    #[arg(long, conflicts_with_all = ["file", "url"])]
    prompt: Option<String>,

    /// Local file input (e.g. audio)
    #[arg(long, conflicts_with = "url")]
    file: Option<PathBuf>,

    /// MIME type of `--file`, sniffed from the extension when omitted
    #[arg(long, requires = "file")]
    content_type: Option<String>,

    /// URL input
    #[arg(long)]
    url: Option<String>,

    /// Restrict resolution to one operation, e.g. "GET /todos"
    #[arg(long, value_parser = parse_operation)]
    operation: Option<OperationKey>,

    /// Output modules to run; the default module when none are given
    #[arg(long = "output-module")]
    output_modules: Vec<String>,

    /// Run every supported output module
    #[arg(long)]
    all_outputs: bool,

    /// Header sent to the plugin API, KEY=VALUE
    #[arg(long = "header", value_parser = parse_key_val)]
    headers: Vec<(String, String)>,

    /// Query parameter carrying API credentials, KEY=VALUE
    #[arg(long = "auth-query", value_parser = parse_key_val)]
    auth_query_params: Vec<(String, String)>,

    #[arg(long, value_enum, default_value_t = ProviderKind::Openai)]
    provider: ProviderKind,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    /// Where file outputs are written
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Abort the whole run after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct FunctionsArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, value_parser = parse_operation)]
    operation: Option<OperationKey>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    Ok((k.trim().to_string(), v.to_string()))
}

fn parse_operation(s: &str) -> Result<OperationKey, String> {
    let (method, path) = s
        .trim()
        .split_once(' ')
        .ok_or_else(|| format!("expected \"METHOD /path\", got `{s}`"))?;
    Ok(OperationKey::new(path.trim(), method))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Functions(args) => functions(args).await,
        Commands::Schema(args) => {
            write_schema(&args.out_dir)?;
            println!("Schemas written to {}", args.out_dir.display());
            Ok(())
        }
    }
}

async fn setup(common: &CommonArgs) -> anyhow::Result<(TelemetryHandle, Config, reqwest::Client)> {
    let log_config = LogConfig::new(common.log_level, common.log_dir.clone(), common.otel_endpoint.clone());
    let telemetry = init_tracing(&log_config).context("could not initialise logging")?;

    let config_mgr = ConfigManager(EnvConfigManager::new(common.env_file.clone()));
    let config = Config::from_manager(&config_mgr).await?;
    let client = reqwest::Client::builder()
        .user_agent(concat!("openplugin/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("could not build HTTP client")?;
    Ok((telemetry, config, client))
}

async fn functions(args: FunctionsArgs) -> anyhow::Result<()> {
    let (telemetry, _config, client) = setup(&args.common).await?;
    let plugin = PluginLoader::new(client).load(&args.common.plugin).await?;

    let mut functions = Functions::new();
    functions.add_from_plugin(plugin, args.operation.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&functions.litellm_json())?);
    telemetry.shutdown();
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let (telemetry, config, client) = setup(&args.common).await?;
    let config = match &args.storage_dir {
        Some(dir) => config.with_storage_dir(dir),
        None => config,
    };

    let input = match (&args.prompt, &args.file, &args.url) {
        (Some(prompt), _, _) => PipelineInput::Text(prompt.clone()),
        (_, Some(path), _) => PipelineInput::File {
            path: path.clone(),
            content_type: args.content_type.clone(),
        },
        (_, _, Some(url)) => PipelineInput::Url(url.clone()),
        _ => bail!("one of --prompt, --file or --url is required"),
    };

    let mut request = PipelineRequest::new(input).with_output_modules(args.output_modules.clone());
    request.headers.extend(args.headers.iter().cloned());
    request.auth_query_params.extend(args.auth_query_params.iter().cloned());
    request.selected_operation = args.operation.clone();
    request.run_all_output_modules = args.all_outputs;

    let mut settings = ProviderSettings {
        provider: args.provider,
        temperature: args.temperature,
        ..ProviderSettings::default()
    };
    if let Some(model) = &args.model {
        settings.model_name = model.clone();
    }

    info!("openplugin starting up…");
    let plugin = PluginLoader::new(client.clone()).load(&args.common.plugin).await?;
    let provider = build_provider(settings, client.clone());
    let http = Arc::new(ReqwestHttp::new(
        client.clone(),
        Duration::from_secs(config.http_timeout_secs),
    ));
    let ctx = ProcessorContext::new(config, client)?;
    let pipeline = Pipeline::new(provider, http, ctx);

    let limit = Duration::from_secs(args.timeout_secs);
    let outcome = telemetry
        .instrument_request("pipeline_run", || async {
            match tokio::time::timeout(limit, pipeline.run(plugin, request)).await {
                Ok(result) => result.map_err(anyhow::Error::new),
                Err(_) => Err(anyhow!("run timed out after {}s", args.timeout_secs)),
            }
        })
        .await;

    let code = match outcome {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response.to_json()?)?);
            0
        }
        Err(e) => {
            error!("Plugin run failed: {:#}", e);
            let payload = match e.downcast_ref::<PipelineError>() {
                Some(p) => p.to_payload(),
                None => serde_json::json!({"error": "run", "message": e.to_string()}),
            };
            eprintln!("{}", serde_json::to_string_pretty(&payload)?);
            1
        }
    };

    telemetry.shutdown();
    process::exit(code);
}
