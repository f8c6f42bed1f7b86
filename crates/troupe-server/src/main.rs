use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use troupe_core::{ChatDispatcher, CoreConfig, LlmRouter};
use troupe_memory::embedding::{EmbeddingProvider, OpenAiEmbeddingProvider, StubEmbeddingProvider};
use troupe_memory::{ConversationStore, MessageStore, Store};
use troupe_provider::{openai, AnthropicProvider, ProviderRegistry, StubProvider};
use troupe_server::state::AppState;

#[derive(Parser)]
#[command(name = "troupe-server", about = "Multi-agent team orchestration server")]
struct Args {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = "troupe.yaml")]
    config: PathBuf,

    /// SQLite database path.
    #[arg(long, default_value = "troupe.db")]
    db: String,

    #[arg(long, env = "TROUPE_BIND", default_value = "0.0.0.0:3009")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("troupe_server=info,troupe_core=info,tower_http=debug")),
        )
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        CoreConfig::load(&args.config)?
    } else {
        CoreConfig::default()
    };
    let config = Arc::new(config);

    let mut registry = ProviderRegistry::new();
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        registry.register(
            "anthropic",
            Arc::new(AnthropicProvider::new(key, "https://api.anthropic.com")),
        );
    } else {
        tracing::warn!("ANTHROPIC_API_KEY not set, registering stub anthropic provider");
        registry.register("anthropic", Arc::new(StubProvider));
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        registry.register("openai", Arc::new(openai(key)));
    }
    let router = Arc::new(LlmRouter::new(Arc::new(registry), vec![]));

    let embedder: Arc<dyn EmbeddingProvider> = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => Arc::new(OpenAiEmbeddingProvider::new(key)),
        Err(_) => {
            tracing::warn!("OPENAI_API_KEY not set, using stub embeddings");
            Arc::new(StubEmbeddingProvider::new(256))
        }
    };

    let store = Arc::new(Store::open(&args.db)?);
    let conversations: Arc<dyn ConversationStore> = Arc::new(store.conversations());
    let messages: Arc<dyn MessageStore> = Arc::new(store.messages());

    let dispatcher = ChatDispatcher::new(
        router,
        config,
        conversations,
        messages,
        store.orchestration(),
        store.kb(),
        embedder,
    )?;

    let state = AppState { dispatcher, store };
    troupe_server::serve(state, &args.bind).await
}
