use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use dotenv::dotenv;
use lex_chunker::{ChunkerConfig, LegalChunker};
use lex_core::{
    AnalysisResult, AnalyzeRequest, CheckerSettings, CorpusStats, Document, DocumentStatus,
    Invoice, LegalDefinition, LegalSearchResult,
};
use lex_error::{LexError, Result};
use lex_llm::{make_embed_model, ChatProviderConfig, EmbedProviderConfig, ProviderRegistry};
use lex_pipeline::{
    run_queue, AnalysisJob, AnalysisOrchestrator, BasicPrecheckEngine, DocumentStore, JobQueue,
    NoopSimilarCaseSource, PassthroughExtractor,
};
use lex_retrieval::{
    LegalIndex, LegalRetrievalService, MemoryLegalIndex, MockEmbedModel, QdrantLegalIndex,
    SearchOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    store: DocumentStore,
    queue: Arc<JobQueue>,
    retrieval: Arc<LegalRetrievalService>,
    registry: Arc<ProviderRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let data_dir = env_or("DATA_DIR", "data/lex");
    let store = DocumentStore::open(&data_dir)?;
    let queue = Arc::new(JobQueue::restore(store.clone())?);

    let embed_model = build_embed_model();
    let index = build_index(embed_model.clone()).await?;
    let retrieval = Arc::new(LegalRetrievalService::new(embed_model, index));
    let registry = Arc::new(build_registry());

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        store.clone(),
        registry.clone(),
        retrieval.clone(),
        Arc::new(PassthroughExtractor),
        Arc::new(BasicPrecheckEngine),
        Arc::new(NoopSimilarCaseSource),
    ));
    // EMBEDDED_RUNNER=0 时不在进程内消费队列，由独立 worker 跑
    if env_or("EMBEDDED_RUNNER", "1") != "0" {
        let queue = queue.clone();
        tokio::spawn(async move { run_queue(orchestrator, queue).await });
    }

    let state = AppState {
        store,
        queue,
        retrieval,
        registry,
    };

    let app = router(state);

    let addr: SocketAddr =
        format!("{}:{}", env_or("HOST", "0.0.0.0"), env_or("PORT", "8080")).parse()?;
    info!(%addr, "lex-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/rulesets/:id/checkers",
            get(get_checkers).put(put_checkers).delete(delete_checkers),
        )
        .route("/api/legal/regulations/json", post(ingest_regulation))
        .route("/api/legal/national-laws/json", post(ingest_national_law))
        .route("/api/legal/search", get(legal_search))
        .route("/api/legal/stats", get(legal_stats))
        .route("/api/legal/definitions", get(legal_definitions))
        .route("/api/documents", get(list_documents).post(create_document))
        .route("/api/documents/:id", get(get_document))
        .route("/api/documents/:id/results", get(get_results))
        .route(
            "/api/documents/:id/analyze",
            post(trigger_analysis).delete(revoke_analysis),
        )
        .route("/api/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn build_embed_model() -> Arc<dyn lex_llm::EmbedModel> {
    match (
        std::env::var("EMBEDDING_BASE_URL"),
        std::env::var("EMBEDDING_API_KEY"),
    ) {
        (Ok(base_url), Ok(api_key)) => {
            Arc::from(make_embed_model(EmbedProviderConfig::OpenAiCompat {
                base_url,
                api_key,
                model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            }))
        }
        _ => {
            warn!("EMBEDDING_BASE_URL/EMBEDDING_API_KEY not set, using mock embeddings");
            Arc::new(MockEmbedModel::default())
        }
    }
}

async fn build_index(
    embed_model: Arc<dyn lex_llm::EmbedModel>,
) -> anyhow::Result<Arc<dyn LegalIndex>> {
    match std::env::var("QDRANT_URL") {
        Ok(url) => {
            // 探测嵌入维度，与 collection 配置保持一致
            let vector_size = embed_model
                .embed(&["dimension probe".to_string()])
                .await?
                .first()
                .map(|v| v.len())
                .unwrap_or(1536);
            let collection = env_or("QDRANT_COLLECTION", "legal_chunks");
            let index = QdrantLegalIndex::new(&url, &collection, vector_size).await?;
            info!(collection = %collection, vector_size, "using qdrant legal index");
            Ok(Arc::new(index))
        }
        Err(_) => {
            info!("QDRANT_URL not set, using in-memory legal index");
            Ok(Arc::new(MemoryLegalIndex::new()))
        }
    }
}

fn build_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let mut configured = 0usize;

    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        registry = registry.register_chat(
            "openai",
            ChatProviderConfig::OpenAiCompat {
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com"),
                api_key,
                model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            },
        );
        configured += 1;
    }
    if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
        registry = registry.register_chat(
            "anthropic",
            ChatProviderConfig::Anthropic {
                api_url: std::env::var("ANTHROPIC_API_URL").ok(),
                api_key,
                model: env_or("ANTHROPIC_MODEL", "claude-sonnet-4-20250514"),
            },
        );
        configured += 1;
    }
    if configured == 0 {
        warn!("no chat provider configured, analysis requests will fail");
    }
    registry
}

// ===============
// Checker settings
// ===============

async fn get_checkers(
    State(state): State<AppState>,
    Path(ruleset_id): Path<String>,
) -> Result<Json<CheckerSettings>> {
    Ok(Json(state.store.checker_settings(&ruleset_id)?))
}

async fn put_checkers(
    State(state): State<AppState>,
    Path(ruleset_id): Path<String>,
    Json(settings): Json<CheckerSettings>,
) -> Result<Json<CheckerSettings>> {
    state.store.put_checker_settings(&ruleset_id, &settings)?;
    info!(
        ruleset_id = %ruleset_id,
        legal_enabled = settings.legal_checker.enabled,
        "checker settings updated"
    );
    Ok(Json(settings))
}

/// 删除配置即回落到默认值
async fn delete_checkers(
    State(state): State<AppState>,
    Path(ruleset_id): Path<String>,
) -> Result<Json<CheckerSettings>> {
    state.store.delete_checker_settings(&ruleset_id)?;
    Ok(Json(CheckerSettings::default()))
}

// ===============
// Legal corpus
// ===============

#[derive(Debug, Deserialize)]
struct IngestSourceRequest {
    source_id: String,
    /// 法规简称，拼进块引用（如 "VO (EU) 2021/1060"）
    instrument: String,
    document_type: Option<String>,
    funding_period: Option<String>,
    jurisdiction: Option<String>,
    text: String,
}

#[derive(Debug, Serialize)]
struct IngestSourceResponse {
    source_id: String,
    chunks: usize,
    definitions: usize,
}

fn hierarchy_level_for(document_type: &str) -> Option<u8> {
    match document_type {
        "treaty" => Some(1),
        "regulation" => Some(2),
        "directive" => Some(3),
        "national_law" => Some(4),
        "ordinance" => Some(5),
        "administrative_provision" => Some(6),
        "guidance" => Some(7),
        _ => None,
    }
}

async fn ingest_source(
    state: &AppState,
    req: IngestSourceRequest,
    default_level: u8,
) -> Result<Json<IngestSourceResponse>> {
    let level = match req.document_type.as_deref() {
        Some(kind) => hierarchy_level_for(kind).ok_or_else(|| LexError::InvalidRequest {
            reason: format!("unknown document_type: {}", kind),
        })?,
        None => default_level,
    };

    let mut config = ChunkerConfig::new(&req.instrument, level);
    config.funding_period = req.funding_period.clone();
    config.jurisdiction = req.jurisdiction.clone();

    let output = LegalChunker::new(config).chunk(&req.source_id, &req.text)?;
    let chunks = output.chunks.len();
    let definitions = output.definitions.len();
    state
        .retrieval
        .ingest(&req.source_id, output.chunks, output.definitions)
        .await?;

    Ok(Json(IngestSourceResponse {
        source_id: req.source_id,
        chunks,
        definitions,
    }))
}

async fn ingest_regulation(
    State(state): State<AppState>,
    Json(req): Json<IngestSourceRequest>,
) -> Result<Json<IngestSourceResponse>> {
    ingest_source(&state, req, 2).await
}

async fn ingest_national_law(
    State(state): State<AppState>,
    Json(req): Json<IngestSourceRequest>,
) -> Result<Json<IngestSourceResponse>> {
    ingest_source(&state, req, 4).await
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    n_results: Option<usize>,
    funding_period: Option<String>,
    /// 逗号分隔的层级白名单，如 "1,2,4"
    hierarchy_levels: Option<String>,
    rerank_by_hierarchy: Option<bool>,
}

fn parse_hierarchy_levels(raw: &str) -> Result<Vec<u8>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<u8>()
                .ok()
                .filter(|level| (1..=7).contains(level))
                .ok_or_else(|| LexError::InvalidRequest {
                    reason: format!("invalid hierarchy level: {}", part.trim()),
                })
        })
        .collect()
}

async fn legal_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<LegalSearchResult>>> {
    let hierarchy_levels = params
        .hierarchy_levels
        .as_deref()
        .map(parse_hierarchy_levels)
        .transpose()?;
    let options = SearchOptions {
        n_results: params.n_results.unwrap_or(5),
        funding_period: params.funding_period,
        hierarchy_levels,
        rerank_by_hierarchy: params.rerank_by_hierarchy.unwrap_or(true),
    };
    let results = state.retrieval.search(&params.query, &options).await?;
    Ok(Json(results))
}

async fn legal_stats(State(state): State<AppState>) -> Result<Json<CorpusStats>> {
    Ok(Json(state.retrieval.stats().await?))
}

#[derive(Debug, Deserialize)]
struct DefinitionParams {
    term: Option<String>,
}

async fn legal_definitions(
    State(state): State<AppState>,
    Query(params): Query<DefinitionParams>,
) -> Json<Vec<LegalDefinition>> {
    Json(state.retrieval.definitions(params.term.as_deref()).await)
}

// ===============
// Documents & analysis
// ===============

#[derive(Debug, Deserialize)]
struct CreateDocumentRequest {
    file_name: String,
    ruleset_id: Option<String>,
    text: Option<String>,
    invoice: Option<Invoice>,
}

async fn create_document(
    State(state): State<AppState>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<Json<Document>> {
    if req.file_name.trim().is_empty() {
        return Err(LexError::InvalidRequest {
            reason: "file_name must not be empty".to_string(),
        });
    }
    let now = chrono::Utc::now();
    let document = Document {
        id: Uuid::new_v4(),
        file_name: req.file_name,
        ruleset_id: req.ruleset_id,
        status: DocumentStatus::Uploaded,
        error: None,
        extracted_text: req.text,
        invoice: req.invoice,
        created_at: now,
        updated_at: now,
    };
    state.store.put_document(&document)?;
    info!(document_id = %document.id, "document uploaded");
    Ok(Json(document))
}

async fn list_documents(State(state): State<AppState>) -> Result<Json<Vec<Document>>> {
    Ok(Json(state.store.list_documents()?))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>> {
    Ok(Json(state.store.get_document(id)?))
}

async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AnalysisResult>>> {
    // 未知文档是 404，已知文档无结果时返回空列表
    state.store.get_document(id)?;
    Ok(Json(state.store.results_for(id)?))
}

async fn trigger_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<serde_json::Value>> {
    if !state.registry.has_provider(&req.provider) {
        return Err(LexError::InvalidRequest {
            reason: format!("unknown provider: {}", req.provider),
        });
    }
    let document = state.store.get_document(id)?;
    if matches!(
        document.status,
        DocumentStatus::Parsing | DocumentStatus::Analyzing
    ) {
        return Err(LexError::Conflict {
            details: format!("document {} is already being processed", id),
        });
    }
    // 尚未解析且无任何可解析内容的文档同步拒绝，而不是异步跑进 error
    if document.status == DocumentStatus::Uploaded
        && document.extracted_text.is_none()
        && document.invoice.is_none()
    {
        return Err(LexError::Conflict {
            details: format!("document {} has no extractable content", id),
        });
    }

    let queued = state
        .queue
        .push(AnalysisJob {
            document_id: id,
            provider: req.provider,
            model: req.model,
        })
        .await?;
    info!(document_id = %id, queued, "analysis requested");
    Ok(Json(json!({ "document_id": id, "queued": queued })))
}

async fn revoke_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let revoked = state.queue.revoke(id).await?;
    Ok(Json(json!({ "document_id": id, "revoked": revoked })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let store = DocumentStore::temporary().unwrap();
        let queue = Arc::new(JobQueue::restore(store.clone()).unwrap());
        let retrieval = Arc::new(LegalRetrievalService::new(
            Arc::new(MockEmbedModel::default()),
            Arc::new(MemoryLegalIndex::new()),
        ));
        AppState {
            store,
            queue,
            retrieval,
            registry: Arc::new(ProviderRegistry::new().register_chat(
                "static",
                ChatProviderConfig::Static {
                    response: "{}".to_string(),
                },
            )),
        }
    }

    #[tokio::test]
    async fn test_ingest_then_search() {
        let state = test_state();
        let response = ingest_source(
            &state,
            IngestSourceRequest {
                source_id: "vo-1060".to_string(),
                instrument: "VO (EU) 2021/1060".to_string(),
                document_type: None,
                funding_period: Some("2021-2027".to_string()),
                jurisdiction: None,
                text: "Artikel 53 Förderfähige Kosten\n(1) Förderfähig sind Kosten für IT-Beratung."
                    .to_string(),
            },
            2,
        )
        .await
        .unwrap();
        assert!(response.0.chunks >= 1);

        let results = legal_search(
            State(state.clone()),
            Query(SearchParams {
                query: "IT-Beratung".to_string(),
                n_results: Some(3),
                funding_period: None,
                hierarchy_levels: None,
                rerank_by_hierarchy: None,
            }),
        )
        .await
        .unwrap();
        assert!(!results.0.is_empty());
        assert_eq!(results.0[0].norm_citation, "Art. 53 VO (EU) 2021/1060");

        // 层级白名单把 level 2 的语料排除在外
        let filtered = legal_search(
            State(state),
            Query(SearchParams {
                query: "IT-Beratung".to_string(),
                n_results: Some(3),
                funding_period: None,
                hierarchy_levels: Some("5,6".to_string()),
                rerank_by_hierarchy: None,
            }),
        )
        .await
        .unwrap();
        assert!(filtered.0.is_empty());
    }

    #[test]
    fn test_hierarchy_levels_param_parsing() {
        assert_eq!(parse_hierarchy_levels("1, 2,4").unwrap(), vec![1, 2, 4]);
        assert!(parse_hierarchy_levels("2,neun").is_err());
        assert!(parse_hierarchy_levels("0").is_err());
        assert!(parse_hierarchy_levels("8").is_err());
    }

    #[tokio::test]
    async fn test_unknown_document_type_rejected() {
        let state = test_state();
        let err = ingest_source(
            &state,
            IngestSourceRequest {
                source_id: "x".to_string(),
                instrument: "X".to_string(),
                document_type: Some("blog_post".to_string()),
                funding_period: None,
                jurisdiction: None,
                text: "Artikel 1 Text".to_string(),
            },
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LexError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_analysis_requires_known_provider() {
        let state = test_state();
        let document = create_document(
            State(state.clone()),
            Json(CreateDocumentRequest {
                file_name: "rechnung.pdf".to_string(),
                ruleset_id: None,
                text: Some("Rechnung".to_string()),
                invoice: None,
            }),
        )
        .await
        .unwrap();

        let err = trigger_analysis(
            State(state.clone()),
            Path(document.0.id),
            Json(AnalyzeRequest {
                provider: "nonexistent".to_string(),
                model: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LexError::InvalidRequest { .. }));

        let queued = trigger_analysis(
            State(state),
            Path(document.0.id),
            Json(AnalyzeRequest {
                provider: "static".to_string(),
                model: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(queued.0["queued"], true);
    }

    #[tokio::test]
    async fn test_analysis_rejects_contentless_upload() {
        let state = test_state();
        let document = create_document(
            State(state.clone()),
            Json(CreateDocumentRequest {
                file_name: "leer.pdf".to_string(),
                ruleset_id: None,
                text: None,
                invoice: None,
            }),
        )
        .await
        .unwrap();

        let err = trigger_analysis(
            State(state),
            Path(document.0.id),
            Json(AnalyzeRequest {
                provider: "static".to_string(),
                model: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LexError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_checker_settings_roundtrip() {
        let state = test_state();
        let defaults = get_checkers(State(state.clone()), Path("default".to_string()))
            .await
            .unwrap();
        assert!(!defaults.0.legal_checker.enabled);

        let mut settings = CheckerSettings::default();
        settings.legal_checker.enabled = true;
        put_checkers(
            State(state.clone()),
            Path("default".to_string()),
            Json(settings),
        )
        .await
        .unwrap();

        let reset = delete_checkers(State(state.clone()), Path("default".to_string()))
            .await
            .unwrap();
        assert!(!reset.0.legal_checker.enabled);
        let current = get_checkers(State(state), Path("default".to_string()))
            .await
            .unwrap();
        assert!(!current.0.legal_checker.enabled);
    }
}
