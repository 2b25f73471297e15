use crate::collaborators::{PrecheckEngine, SimilarCaseSource, TextExtractor};
use crate::store::{AnalysisJob, DocumentStore};
use lex_analysis::AnalysisEngine;
use lex_core::{
    AnalysisResult, CheckerSettings, Document, DocumentStatus, Invoice, InvoiceAnalysisRequest,
    LegalContextEntry, PrecheckFinding, PrecheckSeverity,
};
use lex_error::{LexError, Result};
use lex_llm::ProviderRegistry;
use lex_retrieval::{LegalRetrievalService, SearchOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// 预检必填字段的默认集合
pub const DEFAULT_MANDATORY_FIELDS: &[&str] = &[
    "invoice_number",
    "supplier",
    "invoice_date",
    "gross_amount",
];

const MAX_ATTEMPTS: usize = 3;
const RETRY_BASE_MS: u64 = 500;

/// 分析流水线编排器
///
/// 按阶段推进单个文档：解析 → 预检 → 相似案例 → 法规检索 →
/// 模型分析 → 结果落盘。法规检索是尽力而为的增强阶段，
/// 任何失败都降级为无法规语境继续分析，绝不让文档进入 Error。
pub struct AnalysisOrchestrator {
    store: DocumentStore,
    registry: Arc<ProviderRegistry>,
    retrieval: Arc<LegalRetrievalService>,
    extractor: Arc<dyn TextExtractor>,
    precheck: Arc<dyn PrecheckEngine>,
    similar_cases: Arc<dyn SimilarCaseSource>,
}

impl AnalysisOrchestrator {
    pub fn new(
        store: DocumentStore,
        registry: Arc<ProviderRegistry>,
        retrieval: Arc<LegalRetrievalService>,
        extractor: Arc<dyn TextExtractor>,
        precheck: Arc<dyn PrecheckEngine>,
        similar_cases: Arc<dyn SimilarCaseSource>,
    ) -> Self {
        Self {
            store,
            registry,
            retrieval,
            extractor,
            precheck,
            similar_cases,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// 跑完一个分析任务。失败时文档被置为 error 状态并返回原始错误。
    #[instrument(skip(self, job), fields(document_id = %job.document_id))]
    pub async fn run(&self, job: &AnalysisJob) -> Result<AnalysisResult> {
        match self.execute(job).await {
            Ok(result) => Ok(result),
            Err(e) => {
                e.log(
                    &lex_error::ErrorMetadata::new(&e, "pipeline")
                        .with_operation("analyze")
                        .with_document(&job.document_id.to_string()),
                );
                let _ = self.store.set_status(
                    job.document_id,
                    DocumentStatus::Error,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &AnalysisJob) -> Result<AnalysisResult> {
        let mut document = self.store.get_document(job.document_id)?;

        if document.status == DocumentStatus::Uploaded {
            document = self.parse(document).await?;
        }
        document = self
            .store
            .set_status(document.id, DocumentStatus::Analyzing, None)?;

        let invoice = document.invoice.clone().unwrap_or_default();
        let ruleset_id = document
            .ruleset_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let settings = self.store.checker_settings(&ruleset_id)?;

        let mandatory_fields: Vec<String> = DEFAULT_MANDATORY_FIELDS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let precheck_findings =
            self.run_prechecks(&document, &invoice, &mandatory_fields, &settings)?;

        let similar_cases = match self.similar_cases.similar(&invoice).await {
            Ok(cases) => cases,
            Err(e) => {
                warn!(document_id = %document.id, error = %e, "similar case lookup failed");
                Vec::new()
            }
        };

        let legal_context = self.build_legal_context(&document, &invoice, &settings).await;

        let request = InvoiceAnalysisRequest {
            document_id: document.id,
            ruleset_id: ruleset_id.clone(),
            invoice,
            precheck_findings,
            project_context: None,
            beneficiary_context: None,
            similar_cases,
            legal_context,
            mandatory_fields,
        };

        let chat_model = self
            .registry
            .chat_model(&job.provider, job.model.as_deref())?;
        let engine = AnalysisEngine::new(chat_model, &job.provider);

        let result = run_with_retries(|| engine.analyze(&request)).await?;

        self.store.append_result(&result)?;
        self.store
            .set_status(document.id, DocumentStatus::Analyzed, None)?;
        info!(
            document_id = %document.id,
            assessment = ?result.overall_assessment,
            "analysis pipeline complete"
        );
        Ok(result)
    }

    async fn parse(&self, document: Document) -> Result<Document> {
        let document = self
            .store
            .set_status(document.id, DocumentStatus::Parsing, None)?;
        let (text, invoice) = self.extractor.extract(&document).await?;
        self.store.update_extraction(document.id, text, invoice)?;
        self.store
            .set_status(document.id, DocumentStatus::Parsed, None)
    }

    fn run_prechecks(
        &self,
        document: &Document,
        invoice: &Invoice,
        mandatory_fields: &[String],
        settings: &CheckerSettings,
    ) -> Result<Vec<PrecheckFinding>> {
        let mut findings = self.precheck.run(
            invoice,
            mandatory_fields,
            settings.amount_checker.tolerance_percent,
        );
        if !settings.amount_checker.enabled {
            findings.retain(|f| f.field != "gross_amount" || f.severity != PrecheckSeverity::Warning);
        }

        if settings.duplicate_checker.enabled {
            if let Some(other) = self.store.find_duplicate(invoice, document.id)? {
                findings.push(PrecheckFinding {
                    field: "invoice_number".to_string(),
                    severity: PrecheckSeverity::Warning,
                    message: format!("mögliches Duplikat von Dokument {}", other),
                });
            }
        }
        Ok(findings)
    }

    /// 法规检索阶段。关闭、无可检索文本或检索失败都返回 None，
    /// 提示词组装端据此省略法规段。
    async fn build_legal_context(
        &self,
        document: &Document,
        invoice: &Invoice,
        settings: &CheckerSettings,
    ) -> Option<Vec<LegalContextEntry>> {
        let checker = &settings.legal_checker;
        if !checker.enabled {
            return None;
        }

        let query = legal_query(invoice);
        if query.is_empty() {
            warn!(document_id = %document.id, "no text available for legal retrieval");
            return None;
        }

        let options = SearchOptions {
            n_results: checker.max_results as usize,
            funding_period: Some(checker.funding_period.clone()),
            hierarchy_levels: None,
            rerank_by_hierarchy: checker.use_hierarchy_weighting,
        };
        let results = match self.retrieval.search(&query, &options).await {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    document_id = %document.id,
                    error = %e,
                    "legal retrieval failed, continuing without legal context"
                );
                return None;
            }
        };

        let mut entries = Vec::new();
        let mut cited_terms: Vec<String> = Vec::new();
        for result in results {
            if result.weighted_score < checker.min_relevance_score {
                continue;
            }
            for term in &result.definitions_used {
                if !cited_terms.contains(term) {
                    cited_terms.push(term.clone());
                }
            }
            entries.push(LegalContextEntry {
                norm_citation: result.norm_citation,
                source_kind: source_kind(result.hierarchy_level).to_string(),
                content: result.content,
                weighted_score: result.weighted_score,
            });
        }

        if checker.include_definitions {
            for term in cited_terms {
                for definition in self.retrieval.definitions(Some(&term)).await {
                    if definition.term.eq_ignore_ascii_case(&term) {
                        entries.push(LegalContextEntry {
                            norm_citation: definition.norm_citation,
                            source_kind: "definition".to_string(),
                            content: format!("„{}“: {}", definition.term, definition.definition),
                            weighted_score: 0.0,
                        });
                    }
                }
            }
        }

        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }
}

fn legal_query(invoice: &Invoice) -> String {
    let mut parts = Vec::new();
    if let Some(description) = &invoice.service_description {
        parts.push(description.as_str());
    }
    if let Some(category) = &invoice.cost_category {
        parts.push(category.as_str());
    }
    parts.join(" ").trim().to_string()
}

fn source_kind(hierarchy_level: u8) -> &'static str {
    match hierarchy_level {
        1..=3 => "regulation",
        4..=5 => "national_law",
        _ => "guidance",
    }
}

/// 瞬时错误重试，最多 3 次尝试，间隔倍增。
/// 终态错误（结构无效的模型回复、配置错误）立刻返回。
pub async fn run_with_retries<F, Fut, T>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff_ms = RETRY_BASE_MS;
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() || attempt >= MAX_ATTEMPTS {
                    return Err(e);
                }
                warn!(attempt, error = %e, "attempt failed, retrying");
                let delay = e
                    .retry_after()
                    .unwrap_or(Duration::from_millis(backoff_ms));
                tokio::time::sleep(delay).await;
                backoff_ms = backoff_ms.saturating_mul(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BasicPrecheckEngine, NoopSimilarCaseSource, PassthroughExtractor};
    use async_trait::async_trait;
    use chrono::Utc;
    use lex_core::OverallAssessment;
    use lex_llm::{ChatProviderConfig, EmbedModel};
    use lex_retrieval::{MemoryLegalIndex, MockEmbedModel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    const VERDICT: &str = r#"{
        "semantic_check": "plausibel",
        "economic_check": "marktüblich",
        "beneficiary_match": "stimmt überein",
        "warnings": [],
        "overall_assessment": "approved",
        "confidence": 0.9
    }"#;

    /// 记录提示词并返回固定裁决的聊天模型
    struct RecordingChatModel {
        last_system: std::sync::Mutex<String>,
    }

    #[async_trait]
    impl lex_llm::ChatModel for RecordingChatModel {
        async fn chat(&self, system: &str, _user: &str) -> Result<lex_llm::ChatCompletion> {
            *self.last_system.lock().unwrap() = system.to_string();
            Ok(lex_llm::ChatCompletion {
                content: VERDICT.to_string(),
                prompt_tokens: None,
                completion_tokens: None,
            })
        }

        fn model_id(&self) -> &str {
            "recording"
        }
    }

    /// 永远失败的嵌入模型，模拟嵌入服务不可用
    struct FailingEmbedModel;

    #[async_trait]
    impl EmbedModel for FailingEmbedModel {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(LexError::EmbeddingService {
                provider: "test".to_string(),
                message: "connection refused".to_string(),
                retry_after: None,
            })
        }
    }

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new().register_chat(
            "mock",
            ChatProviderConfig::Static {
                response: VERDICT.to_string(),
            },
        ))
    }

    fn orchestrator_with(
        store: DocumentStore,
        retrieval: Arc<LegalRetrievalService>,
        registry: Arc<ProviderRegistry>,
    ) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(
            store,
            registry,
            retrieval,
            Arc::new(PassthroughExtractor),
            Arc::new(BasicPrecheckEngine),
            Arc::new(NoopSimilarCaseSource),
        )
    }

    fn uploaded_document(store: &DocumentStore) -> Document {
        let document = Document {
            id: Uuid::new_v4(),
            file_name: "rechnung.pdf".to_string(),
            ruleset_id: Some("default".to_string()),
            status: DocumentStatus::Uploaded,
            error: None,
            extracted_text: Some("Rechnung RE-1 über IT-Beratung".to_string()),
            invoice: Some(Invoice {
                invoice_number: Some("RE-1".to_string()),
                supplier: Some("ACME GmbH".to_string()),
                invoice_date: Some("2024-03-01".to_string()),
                gross_amount: Some(1190.0),
                service_description: Some("IT-Beratung".to_string()),
                ..Default::default()
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_document(&document).unwrap();
        document
    }

    fn job(document_id: Uuid) -> AnalysisJob {
        AnalysisJob {
            document_id,
            provider: "mock".to_string(),
            model: None,
        }
    }

    fn memory_retrieval() -> Arc<LegalRetrievalService> {
        Arc::new(LegalRetrievalService::new(
            Arc::new(MockEmbedModel::default()),
            Arc::new(MemoryLegalIndex::new()),
        ))
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let orchestrator = orchestrator_with(store.clone(), memory_retrieval(), registry());

        let result = orchestrator.run(&job(document.id)).await.unwrap();
        assert_eq!(result.overall_assessment, OverallAssessment::Approved);
        assert!(!result.legal_context_used);

        let stored = store.get_document(document.id).unwrap();
        assert_eq!(stored.status, DocumentStatus::Analyzed);
        assert_eq!(store.results_for(document.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_appends_second_result() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let orchestrator = orchestrator_with(store.clone(), memory_retrieval(), registry());

        orchestrator.run(&job(document.id)).await.unwrap();
        orchestrator.run(&job(document.id)).await.unwrap();
        assert_eq!(store.results_for(document.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retrieval_failure_degrades_not_fails() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let mut settings = CheckerSettings::default();
        settings.legal_checker.enabled = true;
        store.put_checker_settings("default", &settings).unwrap();

        // 嵌入服务不可用时法规阶段降级，分析照常完成
        let retrieval = Arc::new(LegalRetrievalService::new(
            Arc::new(FailingEmbedModel),
            Arc::new(MemoryLegalIndex::new()),
        ));
        let orchestrator = orchestrator_with(store.clone(), retrieval, registry());

        let result = orchestrator.run(&job(document.id)).await.unwrap();
        assert!(!result.legal_context_used);
        assert_eq!(
            store.get_document(document.id).unwrap().status,
            DocumentStatus::Analyzed
        );
    }

    #[tokio::test]
    async fn test_legal_context_flows_into_prompt() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let mut settings = CheckerSettings::default();
        settings.legal_checker.enabled = true;
        settings.legal_checker.min_relevance_score = 0.0;
        store.put_checker_settings("default", &settings).unwrap();

        let embed = Arc::new(MockEmbedModel::default());
        let index = Arc::new(MemoryLegalIndex::new());
        let retrieval = Arc::new(LegalRetrievalService::new(embed, index));
        retrieval
            .ingest(
                "vo-1060",
                vec![lex_core::LegalChunk {
                    content: "Förderfähig sind Kosten für IT-Beratung".to_string(),
                    norm_citation: "Art. 53 VO (EU) 2021/1060".to_string(),
                    article: Some("53".to_string()),
                    paragraph: None,
                    subparagraph: None,
                    hierarchy_level: 2,
                    cross_references: vec![],
                    definitions_used: vec![],
                    chunk_index: 0,
                    total_chunks: 1,
                    funding_period: Some("2021-2027".to_string()),
                    source_id: "vo-1060".to_string(),
                    created_at: Utc::now(),
                }],
                vec![],
            )
            .await
            .unwrap();

        let chat = Arc::new(RecordingChatModel {
            last_system: std::sync::Mutex::new(String::new()),
        });
        let orchestrator = AnalysisOrchestrator::new(
            store.clone(),
            Arc::new(ProviderRegistry::new().register_shared("mock", chat.clone())),
            retrieval,
            Arc::new(PassthroughExtractor),
            Arc::new(BasicPrecheckEngine),
            Arc::new(NoopSimilarCaseSource),
        );

        let result = orchestrator.run(&job(document.id)).await.unwrap();
        assert!(result.legal_context_used);
        let system = chat.last_system.lock().unwrap().clone();
        assert!(system.contains("Art. 53 VO (EU) 2021/1060"));
    }

    /// 固定向量：语料块与查询的余弦相似度恒为 0.5
    struct LowSimilarityEmbedModel;

    #[async_trait]
    impl EmbedModel for LowSimilarityEmbedModel {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("Förderfähig") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.5, 0.866]
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_results_below_threshold_are_dropped() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let mut settings = CheckerSettings::default();
        settings.legal_checker.enabled = true;
        settings.legal_checker.min_relevance_score = 0.9;
        store.put_checker_settings("default", &settings).unwrap();

        let retrieval = Arc::new(LegalRetrievalService::new(
            Arc::new(LowSimilarityEmbedModel),
            Arc::new(MemoryLegalIndex::new()),
        ));
        retrieval
            .ingest(
                "vo-1060",
                vec![lex_core::LegalChunk {
                    content: "Förderfähig sind Kosten für IT-Beratung".to_string(),
                    norm_citation: "Art. 53 VO (EU) 2021/1060".to_string(),
                    article: Some("53".to_string()),
                    paragraph: None,
                    subparagraph: None,
                    hierarchy_level: 2,
                    cross_references: vec![],
                    definitions_used: vec![],
                    chunk_index: 0,
                    total_chunks: 1,
                    funding_period: Some("2021-2027".to_string()),
                    source_id: "vo-1060".to_string(),
                    created_at: Utc::now(),
                }],
                vec![],
            )
            .await
            .unwrap();

        let chat = Arc::new(RecordingChatModel {
            last_system: std::sync::Mutex::new(String::new()),
        });
        let orchestrator = AnalysisOrchestrator::new(
            store.clone(),
            Arc::new(ProviderRegistry::new().register_shared("mock", chat.clone())),
            retrieval,
            Arc::new(PassthroughExtractor),
            Arc::new(BasicPrecheckEngine),
            Arc::new(NoopSimilarCaseSource),
        );

        // 加权分 0.5 × 1.4 = 0.7 低于阈值 0.9，法规段整体省略
        let result = orchestrator.run(&job(document.id)).await.unwrap();
        assert!(!result.legal_context_used);
        let system = chat.last_system.lock().unwrap().clone();
        assert!(!system.contains("Rechtsgrundlagen"));
        assert!(!system.contains("Art. 53"));
    }

    #[tokio::test]
    async fn test_terminal_error_marks_document() {
        let store = DocumentStore::temporary().unwrap();
        let document = uploaded_document(&store);
        let registry = Arc::new(ProviderRegistry::new().register_chat(
            "mock",
            ChatProviderConfig::Static {
                response: "kein JSON".to_string(),
            },
        ));
        let orchestrator = orchestrator_with(store.clone(), memory_retrieval(), registry);

        let err = orchestrator.run(&job(document.id)).await.unwrap_err();
        assert!(matches!(err, LexError::ResponseValidation { .. }));
        let stored = store.get_document(document.id).unwrap();
        assert_eq!(stored.status, DocumentStatus::Error);
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn test_retries_stop_on_terminal_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = run_with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LexError::ResponseValidation {
                    message: "malformed".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_recover_from_transient_error() {
        let calls = AtomicUsize::new(0);
        let result = run_with_retries(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 1 {
                    Err(LexError::Timeout {
                        operation: "chat".to_string(),
                        timeout_ms: 100,
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_exhaust_on_persistent_transient_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = run_with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LexError::Timeout {
                    operation: "chat".to_string(),
                    timeout_ms: 1,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
