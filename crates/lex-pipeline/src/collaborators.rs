use async_trait::async_trait;
use lex_core::{Document, Invoice, PrecheckFinding, PrecheckSeverity, SimilarCase};
use lex_error::{LexError, Result};

/// 文档文本与发票字段提取
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, document: &Document) -> Result<(String, Invoice)>;
}

/// 规则化预检，在模型分析之前跑
pub trait PrecheckEngine: Send + Sync {
    fn run(
        &self,
        invoice: &Invoice,
        mandatory_fields: &[String],
        amount_tolerance_percent: f32,
    ) -> Vec<PrecheckFinding>;
}

/// 历史相似案例来源
#[async_trait]
pub trait SimilarCaseSource: Send + Sync {
    async fn similar(&self, invoice: &Invoice) -> Result<Vec<SimilarCase>>;
}

/// 直传提取器：文档上传时已附带文本与发票字段，直接透传。
/// OCR/布局解析接入时替换此实现。
pub struct PassthroughExtractor;

#[async_trait]
impl TextExtractor for PassthroughExtractor {
    async fn extract(&self, document: &Document) -> Result<(String, Invoice)> {
        let text = document
            .extracted_text
            .clone()
            .ok_or_else(|| LexError::InvalidRequest {
                reason: format!("document {} has no extractable text", document.id),
            })?;
        Ok((text, document.invoice.clone().unwrap_or_default()))
    }
}

/// 基础预检：必填字段存在性 + 金额一致性
pub struct BasicPrecheckEngine;

impl PrecheckEngine for BasicPrecheckEngine {
    fn run(
        &self,
        invoice: &Invoice,
        mandatory_fields: &[String],
        amount_tolerance_percent: f32,
    ) -> Vec<PrecheckFinding> {
        let mut findings = Vec::new();

        for field in mandatory_fields {
            let present = match field.as_str() {
                "invoice_number" => invoice.invoice_number.is_some(),
                "supplier" => invoice.supplier.is_some(),
                "beneficiary" => invoice.beneficiary.is_some(),
                "invoice_date" => invoice.invoice_date.is_some(),
                "net_amount" => invoice.net_amount.is_some(),
                "vat_amount" => invoice.vat_amount.is_some(),
                "gross_amount" => invoice.gross_amount.is_some(),
                "currency" => invoice.currency.is_some(),
                "service_description" => invoice.service_description.is_some(),
                "service_period" => invoice.service_period.is_some(),
                _ => true,
            };
            if !present {
                findings.push(PrecheckFinding {
                    field: field.clone(),
                    severity: PrecheckSeverity::Error,
                    message: format!("Pflichtfeld {} fehlt", field),
                });
            }
        }

        if let (Some(net), Some(vat), Some(gross)) =
            (invoice.net_amount, invoice.vat_amount, invoice.gross_amount)
        {
            let expected = net + vat;
            let tolerance = expected.abs() * (amount_tolerance_percent as f64 / 100.0);
            if (gross - expected).abs() > tolerance {
                findings.push(PrecheckFinding {
                    field: "gross_amount".to_string(),
                    severity: PrecheckSeverity::Warning,
                    message: format!(
                        "Bruttobetrag {:.2} weicht von Netto+USt {:.2} ab",
                        gross, expected
                    ),
                });
            }
        }

        findings
    }
}

/// 空实现：尚无案例库时返回空集
pub struct NoopSimilarCaseSource;

#[async_trait]
impl SimilarCaseSource for NoopSimilarCaseSource {
    async fn similar(&self, _invoice: &Invoice) -> Result<Vec<SimilarCase>> {
        Ok(Vec::new())
    }
}
