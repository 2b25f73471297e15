use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum LexError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("验证失败: {message}")]
    Validation { message: String },

    #[error("资源冲突: {details}")]
    Conflict { details: String },

    // === 流水线阶段错误 ===
    #[error("法规检索错误: {stage}")]
    Retrieval { stage: String, message: String },

    #[error("法规切分错误 ({source_id})")]
    Chunking { source_id: String, message: String },

    #[error("模型响应结构无效: {message}")]
    ResponseValidation { message: String },

    // === 技术错误 ===
    #[error("LLM 服务错误 ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("嵌入服务错误 ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("向量存储错误: {operation} 失败")]
    VectorStore { operation: String, message: String },

    #[error("存储错误: {operation}")]
    Storage { operation: String, message: String },

    #[error("外部服务不可用: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub document_id: Option<String>,
    pub ruleset_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorMetadata {
    pub fn new(error: &LexError, component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            severity: error.severity(),
            component: component.to_string(),
            operation: None,
            document_id: None,
            ruleset_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_document(mut self, document_id: &str) -> Self {
        self.document_id = Some(document_id.to_string());
        self
    }

    pub fn with_ruleset(mut self, ruleset_id: &str) -> Self {
        self.ruleset_id = Some(ruleset_id.to_string());
        self
    }
}

impl LexError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LexError::NotFound { .. } | LexError::InvalidRequest { .. } => ErrorSeverity::Low,
            LexError::Validation { .. }
            | LexError::Conflict { .. }
            | LexError::ResponseValidation { .. } => ErrorSeverity::Medium,
            LexError::Retrieval { .. } | LexError::Chunking { .. } => ErrorSeverity::Medium,
            LexError::LlmService { .. } | LexError::EmbeddingService { .. } => {
                ErrorSeverity::Medium
            }
            LexError::ServiceUnavailable { .. }
            | LexError::Network { .. }
            | LexError::Timeout { .. } => ErrorSeverity::Medium,
            LexError::VectorStore { .. } | LexError::Storage { .. } => ErrorSeverity::High,
            LexError::Serialization { .. } | LexError::Concurrency { .. } => ErrorSeverity::High,
            LexError::Internal { .. } | LexError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误（瞬时故障）
    ///
    /// 结构性失败（响应结构无效、验证、配置）永远不可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LexError::LlmService { .. }
                | LexError::EmbeddingService { .. }
                | LexError::ServiceUnavailable { .. }
                | LexError::Network { .. }
                | LexError::Timeout { .. }
                | LexError::Concurrency { .. }
        )
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            LexError::ServiceUnavailable { retry_after, .. }
            | LexError::LlmService { retry_after, .. }
            | LexError::EmbeddingService { retry_after, .. } => {
                retry_after.or(Some(std::time::Duration::from_millis(500)))
            }
            LexError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            LexError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            LexError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    document_id = ?metadata.document_id,
                    ruleset_id = ?metadata.ruleset_id,
                    error = %self,
                    "pipeline error"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    document_id = ?metadata.document_id,
                    ruleset_id = ?metadata.ruleset_id,
                    error = %self,
                    severity = ?metadata.severity,
                    "pipeline error"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            LexError::NotFound { .. } => 404,
            LexError::InvalidRequest { .. } => 400,
            LexError::Validation { .. } => 400,
            LexError::Conflict { .. } => 409,
            LexError::ServiceUnavailable { .. } => 503,
            LexError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            LexError::NotFound { .. } => "请求的资源不存在".to_string(),
            LexError::InvalidRequest { .. } | LexError::Validation { .. } => {
                "请求参数有误，请检查后重试".to_string()
            }
            LexError::Conflict { .. } => "操作冲突，请稍后重试".to_string(),
            LexError::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试".to_string(),
            LexError::Timeout { .. } => "请求超时，请重试".to_string(),
            LexError::ResponseValidation { .. } => "分析结果无效，该文档已标记为失败".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LexError>;

// === 转换实现 ===

impl From<serde_json::Error> for LexError {
    fn from(err: serde_json::Error) -> Self {
        LexError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for LexError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LexError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            LexError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            LexError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<uuid::Error> for LexError {
    fn from(err: uuid::Error) -> Self {
        LexError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for LexError {
    fn from(err: tokio::task::JoinError) -> Self {
        LexError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<qdrant_client::QdrantError> for LexError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        LexError::VectorStore {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<sled::Error> for LexError {
    fn from(err: sled::Error) -> Self {
        LexError::Storage {
            operation: "sled".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for LexError {
    fn from(err: anyhow::Error) -> Self {
        LexError::Internal {
            message: err.to_string(),
            details: None,
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for LexError {
    fn into_response(self) -> axum::response::Response {
        let status_code = match self {
            LexError::Validation { .. } | LexError::InvalidRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            LexError::NotFound { .. } => StatusCode::NOT_FOUND,
            LexError::Conflict { .. } => StatusCode::CONFLICT,
            LexError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LexError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}
