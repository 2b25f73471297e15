use dotenv::dotenv;
use lex_llm::{ChatProviderConfig, ProviderRegistry};
use lex_pipeline::{
    run_queue, AnalysisOrchestrator, BasicPrecheckEngine, DocumentStore, JobQueue,
    NoopSimilarCaseSource, PassthroughExtractor,
};
use lex_retrieval::{LegalRetrievalService, MemoryLegalIndex, MockEmbedModel};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// 独立队列消费进程。与 API 共用同一 DATA_DIR 时，
/// API 侧需设置 EMBEDDED_RUNNER=0，sled 不支持多进程打开。
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data/lex".to_string());
    let store = DocumentStore::open(&data_dir)?;
    let queue = Arc::new(JobQueue::restore(store.clone())?);

    let mut registry = ProviderRegistry::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        registry = registry.register_chat(
            "openai",
            ChatProviderConfig::OpenAiCompat {
                base_url: std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string()),
                api_key,
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            },
        );
    } else {
        warn!("OPENAI_API_KEY not set, analysis jobs will fail until a provider is configured");
    }

    let retrieval = Arc::new(LegalRetrievalService::new(
        Arc::new(MockEmbedModel::default()),
        Arc::new(MemoryLegalIndex::new()),
    ));

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        store,
        Arc::new(registry),
        retrieval,
        Arc::new(PassthroughExtractor),
        Arc::new(BasicPrecheckEngine),
        Arc::new(NoopSimilarCaseSource),
    ));

    info!(data_dir = %data_dir, "lex-worker consuming analysis queue");
    run_queue(orchestrator, queue).await;
    Ok(())
}

fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
