use chrono::Utc;
use lex_core::{AnalysisResult, CheckerSettings, Document, DocumentStatus, Invoice};
use lex_error::{LexError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// 队列中的分析任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisJob {
    pub document_id: Uuid,
    pub provider: String,
    pub model: Option<String>,
}

/// 基于 sled 的文档与结果存储
///
/// 键布局：doc/<uuid>、res/<doc_uuid>/<result_uuid>、checkers/<ruleset>、queue。
/// 状态变更统一走 set_status，非法迁移返回 Conflict。
#[derive(Clone)]
pub struct DocumentStore {
    db: sled::Db,
}

impl DocumentStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// 进程内临时库，测试用
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn doc_key(id: Uuid) -> String {
        format!("doc/{}", id)
    }

    fn result_prefix(document_id: Uuid) -> String {
        format!("res/{}/", document_id)
    }

    pub fn put_document(&self, document: &Document) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        self.db.insert(Self::doc_key(document.id), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_document(&self, id: Uuid) -> Result<Document> {
        let bytes = self
            .db
            .get(Self::doc_key(id))?
            .ok_or_else(|| LexError::NotFound {
                resource: format!("document {}", id),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        for item in self.db.scan_prefix("doc/") {
            let (_, bytes) = item?;
            documents.push(serde_json::from_slice::<Document>(&bytes)?);
        }
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents)
    }

    /// 状态迁移。非法迁移不落盘，返回 Conflict。
    pub fn set_status(
        &self,
        id: Uuid,
        to: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document> {
        let mut document = self.get_document(id)?;
        if !document.status.can_transition(to) {
            return Err(LexError::Conflict {
                details: format!(
                    "document {} cannot move from {} to {}",
                    id, document.status, to
                ),
            });
        }
        document.status = to;
        document.error = error;
        document.updated_at = Utc::now();
        self.put_document(&document)?;
        info!(document_id = %id, status = %to, "document status changed");
        Ok(document)
    }

    pub fn update_extraction(
        &self,
        id: Uuid,
        text: String,
        invoice: Invoice,
    ) -> Result<Document> {
        let mut document = self.get_document(id)?;
        document.extracted_text = Some(text);
        document.invoice = Some(invoice);
        document.updated_at = Utc::now();
        self.put_document(&document)?;
        Ok(document)
    }

    /// 结果只追加，重跑分析不会覆盖历史裁决
    pub fn append_result(&self, result: &AnalysisResult) -> Result<()> {
        let key = format!("{}{}", Self::result_prefix(result.document_id), result.id);
        self.db.insert(key, serde_json::to_vec(result)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn results_for(&self, document_id: Uuid) -> Result<Vec<AnalysisResult>> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(Self::result_prefix(document_id)) {
            let (_, bytes) = item?;
            results.push(serde_json::from_slice::<AnalysisResult>(&bytes)?);
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    /// 同一规则集下查找疑似重复发票（相同发票号与供应商）
    pub fn find_duplicate(&self, invoice: &Invoice, exclude: Uuid) -> Result<Option<Uuid>> {
        let (Some(number), Some(supplier)) = (&invoice.invoice_number, &invoice.supplier) else {
            return Ok(None);
        };
        for document in self.list_documents()? {
            if document.id == exclude {
                continue;
            }
            if let Some(other) = &document.invoice {
                if other.invoice_number.as_ref() == Some(number)
                    && other.supplier.as_ref() == Some(supplier)
                {
                    return Ok(Some(document.id));
                }
            }
        }
        Ok(None)
    }

    pub fn checker_settings(&self, ruleset_id: &str) -> Result<CheckerSettings> {
        match self.db.get(format!("checkers/{}", ruleset_id))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(CheckerSettings::default()),
        }
    }

    pub fn put_checker_settings(
        &self,
        ruleset_id: &str,
        settings: &CheckerSettings,
    ) -> Result<()> {
        settings.validate()?;
        self.db
            .insert(format!("checkers/{}", ruleset_id), serde_json::to_vec(settings)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// 删除即恢复默认配置
    pub fn delete_checker_settings(&self, ruleset_id: &str) -> Result<()> {
        self.db.remove(format!("checkers/{}", ruleset_id))?;
        self.db.flush()?;
        Ok(())
    }

    pub fn save_queue(&self, jobs: &[AnalysisJob]) -> Result<()> {
        self.db.insert("queue", serde_json::to_vec(jobs)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_queue(&self) -> Result<Vec<AnalysisJob>> {
        match self.db.get("queue")? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// 重启恢复：把中断时停留在 analyzing 的文档复位为 parsed。
    /// 对应任务尚未 ack、仍在持久化队列里，会由消费循环重新执行。
    /// 绕过 can_transition，仅限启动时调用。
    pub fn recover_in_flight(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut document in self.list_documents()? {
            if document.status == DocumentStatus::Analyzing {
                warn!(document_id = %document.id, "resetting interrupted analysis");
                document.status = DocumentStatus::Parsed;
                document.updated_at = Utc::now();
                self.put_document(&document)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(status: DocumentStatus) -> Document {
        Document {
            id: Uuid::new_v4(),
            file_name: "rechnung.pdf".to_string(),
            ruleset_id: Some("default".to_string()),
            status,
            error: None,
            extracted_text: None,
            invoice: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_document_roundtrip() {
        let store = DocumentStore::temporary().unwrap();
        let doc = document(DocumentStatus::Uploaded);
        store.put_document(&doc).unwrap();
        let loaded = store.get_document(doc.id).unwrap();
        assert_eq!(loaded.file_name, "rechnung.pdf");
        assert_eq!(loaded.status, DocumentStatus::Uploaded);
    }

    #[test]
    fn test_illegal_transition_is_conflict() {
        let store = DocumentStore::temporary().unwrap();
        let doc = document(DocumentStatus::Uploaded);
        store.put_document(&doc).unwrap();

        let err = store
            .set_status(doc.id, DocumentStatus::Analyzed, None)
            .unwrap_err();
        assert!(matches!(err, LexError::Conflict { .. }));
        // 失败的迁移不落盘
        assert_eq!(
            store.get_document(doc.id).unwrap().status,
            DocumentStatus::Uploaded
        );
    }

    #[test]
    fn test_resubmission_transitions() {
        let store = DocumentStore::temporary().unwrap();
        let doc = document(DocumentStatus::Error);
        store.put_document(&doc).unwrap();
        store
            .set_status(doc.id, DocumentStatus::Analyzing, None)
            .unwrap();
        store
            .set_status(doc.id, DocumentStatus::Analyzed, None)
            .unwrap();
        store
            .set_status(doc.id, DocumentStatus::Analyzing, None)
            .unwrap();
    }

    #[test]
    fn test_results_append_only() {
        let store = DocumentStore::temporary().unwrap();
        let doc_id = Uuid::new_v4();
        for confidence in [0.5f32, 0.9] {
            store
                .append_result(&AnalysisResult {
                    id: Uuid::new_v4(),
                    document_id: doc_id,
                    ruleset_id: "default".to_string(),
                    provider: "openai".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    semantic_check: "ok".to_string(),
                    economic_check: "ok".to_string(),
                    beneficiary_match: "ok".to_string(),
                    warnings: vec![],
                    overall_assessment: lex_core::OverallAssessment::Approved,
                    confidence,
                    prompt_tokens: None,
                    completion_tokens: None,
                    latency_ms: 10,
                    legal_context_used: false,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(store.results_for(doc_id).unwrap().len(), 2);
    }

    #[test]
    fn test_checker_settings_default_and_reset() {
        let store = DocumentStore::temporary().unwrap();
        let defaults = store.checker_settings("default").unwrap();
        assert!(!defaults.legal_checker.enabled);

        let mut settings = CheckerSettings::default();
        settings.legal_checker.enabled = true;
        settings.legal_checker.max_results = 3;
        store.put_checker_settings("default", &settings).unwrap();
        assert!(store.checker_settings("default").unwrap().legal_checker.enabled);

        store.delete_checker_settings("default").unwrap();
        assert!(!store.checker_settings("default").unwrap().legal_checker.enabled);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let store = DocumentStore::temporary().unwrap();
        let mut settings = CheckerSettings::default();
        settings.legal_checker.max_results = 50;
        assert!(store.put_checker_settings("default", &settings).is_err());
    }

    #[test]
    fn test_recover_in_flight() {
        let store = DocumentStore::temporary().unwrap();
        let doc = document(DocumentStatus::Analyzing);
        store.put_document(&doc).unwrap();
        assert_eq!(store.recover_in_flight().unwrap(), 1);
        assert_eq!(
            store.get_document(doc.id).unwrap().status,
            DocumentStatus::Parsed
        );
    }

    #[test]
    fn test_find_duplicate() {
        let store = DocumentStore::temporary().unwrap();
        let mut first = document(DocumentStatus::Parsed);
        first.invoice = Some(Invoice {
            invoice_number: Some("RE-1".to_string()),
            supplier: Some("ACME GmbH".to_string()),
            ..Default::default()
        });
        store.put_document(&first).unwrap();

        let probe = Invoice {
            invoice_number: Some("RE-1".to_string()),
            supplier: Some("ACME GmbH".to_string()),
            ..Default::default()
        };
        assert_eq!(
            store.find_duplicate(&probe, Uuid::new_v4()).unwrap(),
            Some(first.id)
        );
        assert_eq!(store.find_duplicate(&probe, first.id).unwrap(), None);
    }
}
