use crate::prompt::{build_system_prompt, build_user_prompt};
use chrono::Utc;
use lex_core::{AnalysisResult, InvoiceAnalysisRequest, OverallAssessment};
use lex_error::{LexError, Result};
use lex_llm::ChatModel;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 模型回复必须符合的结构，多余字段视为结构无效
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmVerdict {
    semantic_check: String,
    economic_check: String,
    beneficiary_match: String,
    warnings: Vec<String>,
    overall_assessment: OverallAssessment,
    confidence: f32,
}

/// 发票分析引擎
///
/// 组装提示词、调用模型、严格解析 JSON 裁决。
/// 解析失败是终态错误（ResponseValidation），不做重试。
pub struct AnalysisEngine {
    chat_model: Arc<dyn ChatModel>,
    provider: String,
}

impl AnalysisEngine {
    pub fn new(chat_model: Arc<dyn ChatModel>, provider: &str) -> Self {
        Self {
            chat_model,
            provider: provider.to_string(),
        }
    }

    #[instrument(skip(self, request), fields(document_id = %request.document_id))]
    pub async fn analyze(&self, request: &InvoiceAnalysisRequest) -> Result<AnalysisResult> {
        let system = build_system_prompt(request);
        let user = build_user_prompt(&request.invoice);

        let started = std::time::Instant::now();
        let completion = self.chat_model.chat(&system, &user).await?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let verdict = parse_verdict(&completion.content)?;
        let legal_context_used = request
            .legal_context
            .as_ref()
            .map(|entries| !entries.is_empty())
            .unwrap_or(false);

        info!(
            document_id = %request.document_id,
            assessment = ?verdict.overall_assessment,
            confidence = verdict.confidence,
            latency_ms,
            legal_context_used,
            "invoice analysis complete"
        );

        Ok(AnalysisResult {
            id: Uuid::new_v4(),
            document_id: request.document_id,
            ruleset_id: request.ruleset_id.clone(),
            provider: self.provider.clone(),
            model: self.chat_model.model_id().to_string(),
            semantic_check: verdict.semantic_check,
            economic_check: verdict.economic_check,
            beneficiary_match: verdict.beneficiary_match,
            warnings: verdict.warnings,
            overall_assessment: verdict.overall_assessment,
            confidence: verdict.confidence,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            latency_ms,
            legal_context_used,
            created_at: Utc::now(),
        })
    }
}

/// 去掉可能的 Markdown 代码围栏后严格解析裁决 JSON。
/// 不修正字段值：confidence 超出 [0,1] 同样视为无效回复。
fn parse_verdict(raw: &str) -> Result<LlmVerdict> {
    let cleaned = strip_code_fences(raw);
    let verdict: LlmVerdict =
        serde_json::from_str(cleaned).map_err(|e| {
            warn!("model returned malformed verdict: {}", e);
            LexError::ResponseValidation {
                message: format!("verdict is not valid JSON: {}", e),
            }
        })?;

    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(LexError::ResponseValidation {
            message: format!("confidence out of range: {}", verdict.confidence),
        });
    }
    Ok(verdict)
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // ```json\n...\n``` 或 ```\n...\n```
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest.trim())
}
