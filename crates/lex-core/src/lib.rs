use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalChunk {
    pub content: String,
    pub norm_citation: String,
    pub article: Option<String>,
    pub paragraph: Option<String>,
    pub subparagraph: Option<String>,
    pub hierarchy_level: u8, // 1 (treaty) .. 7 (non-binding guidance)
    pub cross_references: Vec<String>,
    pub definitions_used: Vec<String>,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub funding_period: Option<String>,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalDefinition {
    pub term: String,
    pub definition: String,
    pub norm_citation: String,
    pub funding_period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalSearchResult {
    pub content: String,
    pub norm_citation: String,
    pub article: Option<String>,
    pub paragraph: Option<String>,
    pub hierarchy_level: u8,
    pub similarity: f32,
    pub weighted_score: f32,
    pub cross_references: Vec<String>,
    pub definitions_used: Vec<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalContextEntry {
    pub norm_citation: String,
    pub source_kind: String, // regulation | national_law | definition | ...
    pub content: String,
    pub weighted_score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: Option<String>,
    pub supplier: Option<String>,
    pub beneficiary: Option<String>,
    pub invoice_date: Option<String>,
    pub net_amount: Option<f64>,
    pub vat_amount: Option<f64>,
    pub gross_amount: Option<f64>,
    pub currency: Option<String>,
    pub service_description: Option<String>,
    pub service_period: Option<String>,
    pub cost_category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecheckSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckFinding {
    pub field: String,
    pub severity: PrecheckSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarCase {
    pub case_id: String,
    pub summary: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceAnalysisRequest {
    pub document_id: Uuid,
    pub ruleset_id: String,
    pub invoice: Invoice,
    pub precheck_findings: Vec<PrecheckFinding>,
    pub project_context: Option<String>,
    pub beneficiary_context: Option<String>,
    pub similar_cases: Vec<SimilarCase>,
    pub legal_context: Option<Vec<LegalContextEntry>>,
    pub mandatory_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalCheckerConfig {
    pub enabled: bool,
    pub funding_period: String, // 2014-2020 | 2021-2027
    pub max_results: u16,
    pub min_relevance_score: f32,
    pub use_hierarchy_weighting: bool,
    pub include_definitions: bool,
}

impl Default for LegalCheckerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            funding_period: "2021-2027".to_string(),
            max_results: 5,
            min_relevance_score: 0.6,
            use_hierarchy_weighting: true,
            include_definitions: true,
        }
    }
}

impl LegalCheckerConfig {
    pub fn validate(&self) -> lex_error::Result<()> {
        if self.max_results < 1 || self.max_results > 20 {
            return Err(lex_error::LexError::Validation {
                message: format!("max_results must be in [1,20], got {}", self.max_results),
            });
        }
        if !(0.0..=1.0).contains(&self.min_relevance_score) {
            return Err(lex_error::LexError::Validation {
                message: format!(
                    "min_relevance_score must be in [0.0,1.0], got {}",
                    self.min_relevance_score
                ),
            });
        }
        if self.funding_period != "2014-2020" && self.funding_period != "2021-2027" {
            return Err(lex_error::LexError::Validation {
                message: format!("unknown funding_period: {}", self.funding_period),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCheckerConfig {
    pub enabled: bool,
}

impl Default for DuplicateCheckerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountCheckerConfig {
    pub enabled: bool,
    pub tolerance_percent: f32,
}

impl Default for AmountCheckerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance_percent: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckerSettings {
    pub legal_checker: LegalCheckerConfig,
    pub duplicate_checker: DuplicateCheckerConfig,
    pub amount_checker: AmountCheckerConfig,
}

impl CheckerSettings {
    pub fn validate(&self) -> lex_error::Result<()> {
        self.legal_checker.validate()?;
        if !(0.0..=100.0).contains(&self.amount_checker.tolerance_percent) {
            return Err(lex_error::LexError::Validation {
                message: format!(
                    "tolerance_percent must be in [0,100], got {}",
                    self.amount_checker.tolerance_percent
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallAssessment {
    Approved,
    ReviewRequired,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub document_id: Uuid,
    pub ruleset_id: String,
    pub provider: String,
    pub model: String,
    pub semantic_check: String,
    pub economic_check: String,
    pub beneficiary_match: String,
    pub warnings: Vec<String>,
    pub overall_assessment: OverallAssessment,
    pub confidence: f32,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: i64,
    pub legal_context_used: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Parsing,
    Parsed,
    Analyzing,
    Analyzed,
    Error,
}

impl DocumentStatus {
    pub fn can_transition(self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, to),
            (Uploaded, Parsing)
                | (Parsing, Parsed)
                | (Parsing, Error)
                | (Parsed, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzing, Error)
                // 重新提交：已分析或失败的文档可再次进入分析
                | (Analyzed, Analyzing)
                | (Error, Analyzing)
        )
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Parsed => "parsed",
            DocumentStatus::Analyzing => "analyzing",
            DocumentStatus::Analyzed => "analyzed",
            DocumentStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub file_name: String,
    pub ruleset_id: Option<String>,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub extracted_text: Option<String>,
    pub invoice: Option<Invoice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub provider: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_sources: u64,
    pub total_chunks: u64,
    pub total_definitions: u64,
    pub chunks_by_level: std::collections::BTreeMap<u8, u64>,
    pub last_ingested: Option<DateTime<Utc>>,
}

pub use lex_error::{LexError as Error, Result};
