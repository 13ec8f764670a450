use std::sync::Arc;

use feynman_tutor::channels::{Channel, CliChannel, DiscordChannel};
use feynman_tutor::config::{AppConfig, ChannelConfig};
use feynman_tutor::llm::{LlmGateway, create_provider};
use feynman_tutor::tutor::{Dispatcher, InMemorySessionStore, PromptSet, TutorEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    // A missing .env is fine; real environment variables still apply.
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;
    let prompts = PromptSet::load(&config.prompt_dir).await?;

    eprintln!("📚 Feynman Tutor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Watching channel: {}", config.tutor.watch_channel_id);
    eprintln!("   Output channel:   {}", config.tutor.output_channel_id);
    eprintln!("   Model:            {} ({})", config.llm.model, config.llm.backend);
    eprintln!("   Prompts:          {}", config.prompt_dir.display());
    if let Some(ref source) = config.tutor.transcript_source_id {
        eprintln!("   Filtering for bot: {}", source);
    }

    let llm = create_provider(&config.llm)?;
    let gateway = LlmGateway::new(llm, config.llm.max_tokens);

    let channel: Arc<dyn Channel> = match config.channel {
        ChannelConfig::Discord { bot_token } => Arc::new(DiscordChannel::new(bot_token)),
        ChannelConfig::Cli => {
            eprintln!("   Channel:          cli (type a message, or @path/to/transcript.md)\n");
            Arc::new(CliChannel::new())
        }
    };
    channel.health_check().await?;

    let engine = Arc::new(TutorEngine::new(
        config.tutor,
        Arc::new(prompts),
        gateway,
        Arc::new(InMemorySessionStore::new()),
        Arc::clone(&channel),
    ));

    let stream = channel.start().await?;
    Dispatcher::new(engine).run(stream).await;

    channel.shutdown().await?;
    Ok(())
}
