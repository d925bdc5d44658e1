use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use fireflies_config::{AppConfig, TelemetryConfig};
use fireflies_llm::ChatBackend;
use fireflies_runtime::{AppState, ChatBody, ChatError, EventEmitter, StreamEvent, serve};
use fireflies_tools::fetch::fallback_results;

#[derive(Debug, Parser)]
#[command(
    name = "fireflies",
    version,
    about = "Streaming chat and web-tool proxy for Ollama Cloud"
)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP proxy.
    Serve {
        /// Override `server.listen_addr`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run one chat locally and print the streamed answer.
    Chat {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        /// Let the model call webSearch / webFetch.
        #[arg(long)]
        tools: bool,
        /// Print the answer once it is complete.
        #[arg(long)]
        no_stream: bool,
    },
    /// List the models the upstream host advertises.
    Models,
    /// Search the web through the relay chain.
    Search {
        query: String,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Fetch one page through the relay chain and print its text.
    Fetch { url: String },
    /// Write the default configuration.
    InitConfig {
        /// Destination; defaults to `--config`.
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(telemetry: &TelemetryConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));
    let stderr = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    if telemetry.log_dir.trim().is_empty() {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(telemetry.log_dir.trim(), "fireflies.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_logging(&config.telemetry);

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if !config.has_api_key() {
                tracing::warn!("OLLAMA_API_KEY is not set; /chat will answer 500");
            }
            serve(AppState::from_config(config)?).await?;
        }
        Commands::Chat {
            prompt,
            model,
            tools,
            no_stream,
        } => run_chat(config, prompt, model, tools, !no_stream).await?,
        Commands::Models => {
            let state = AppState::from_config(config)?;
            let models = state.backend.list_models().await?;
            if models.is_empty() {
                println!("no models advertised");
            }
            for model in models {
                let name = model
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| model.to_string());
                println!("{name}");
            }
        }
        Commands::Search { query, max } => {
            let limit = max
                .unwrap_or(config.tools.search_default_results)
                .clamp(1, config.tools.search_max_results.max(1));
            let state = AppState::from_config(config)?;
            let report = state.fetch.search(&query, limit).await;
            let hits = match report.result {
                Some(hits) => hits,
                None => {
                    eprintln!("search failed ({}); fallback links:", report.failure_summary());
                    fallback_results(&query)
                }
            };
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. {}\n   {}\n   {}", i + 1, hit.title, hit.url, hit.snippet);
            }
        }
        Commands::Fetch { url } => {
            let state = AppState::from_config(config)?;
            let report = state.fetch.fetch_page(&url).await;
            let Some(page) = report.result else {
                bail!("no content extracted from {url} ({})", report.failure_summary());
            };
            if !page.title.is_empty() {
                println!("# {}\n", page.title);
            }
            println!("{}", page.content);
        }
        Commands::InitConfig { path, force } => {
            let path = path.unwrap_or(cli.config);
            write_default_config(&path, force)?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}

async fn run_chat(
    config: AppConfig,
    prompt: String,
    model: Option<String>,
    use_tools: bool,
    stream: bool,
) -> Result<()> {
    if !config.has_api_key() {
        bail!("Ollama API key not configured (set OLLAMA_API_KEY)");
    }
    let state = AppState::from_config(config)?;
    let body = ChatBody {
        prompt: Some(prompt),
        model,
        use_tools,
        stream: Some(stream),
        ..ChatBody::default()
    };
    let prepared = body.prepare(&state.config, &state.tools)?;
    let model = prepared.model.clone();
    info!(model = %model, mode = ?prepared.mode, "running local chat");

    let (tx, mut rx) = mpsc::channel(state.config.server.event_channel_capacity.max(1));
    let session = state.session();
    let task = tokio::spawn(async move {
        let mut emitter = EventEmitter::new(tx);
        session.run(prepared, &mut emitter).await
    });

    let mut stdout = io::stdout();
    let mut answer = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Thinking { content } if stream => eprint!("{content}"),
            StreamEvent::Thinking { .. } => {}
            StreamEvent::Content { content } => {
                if stream {
                    print!("{content}");
                    stdout.flush()?;
                } else {
                    answer.push_str(&content);
                }
            }
            StreamEvent::ToolCall {
                function,
                arguments,
            } => eprintln!("\n[tool] {function} {}", serde_json::Value::Object(arguments)),
            StreamEvent::Error { content } => eprintln!("\n[error] {content}"),
            StreamEvent::Done => {}
        }
    }
    if !stream {
        print!("{answer}");
    }
    println!();

    match task.await? {
        Ok(_) => Ok(()),
        Err(ChatError::Llm(err)) => bail!("{}", err.user_message(&model)),
        Err(ChatError::Disconnected) => bail!("output channel closed"),
    }
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save_to(path)
}
