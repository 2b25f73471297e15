use crate::store::{AnalysisJob, DocumentStore};
use lex_error::Result;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// 持久化的分析任务队列
///
/// 入队、出队、撤销都立即写回存储，进程重启后队列内容不丢失。
pub struct JobQueue {
    store: DocumentStore,
    jobs: RwLock<VecDeque<AnalysisJob>>,
}

impl JobQueue {
    /// 从存储恢复队列内容
    pub fn restore(store: DocumentStore) -> Result<Self> {
        let persisted = store.load_queue()?;
        if !persisted.is_empty() {
            info!(jobs = persisted.len(), "restored analysis queue");
        }
        Ok(Self {
            store,
            jobs: RwLock::new(persisted.into()),
        })
    }

    /// 入队。同一文档已有排队任务时不重复入队。
    pub async fn push(&self, job: AnalysisJob) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.document_id == job.document_id) {
            return Ok(false);
        }
        jobs.push_back(job);
        self.persist(&jobs)?;
        Ok(true)
    }

    /// 取队首任务但不出队。跑完后由 ack 移除，崩溃时任务仍在
    /// 持久化队列里，重启后重新执行（至少一次交付）。
    pub async fn peek(&self) -> Option<AnalysisJob> {
        self.jobs.read().await.front().cloned()
    }

    /// 确认队首任务已处理完毕并出队
    pub async fn ack(&self, document_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.front() {
            Some(job) if job.document_id == document_id => {
                jobs.pop_front();
                self.persist(&jobs)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 撤销某文档的排队任务，返回是否有任务被移除
    pub async fn revoke(&self, document_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|j| j.document_id != document_id);
        let removed = jobs.len() < before;
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn persist(&self, jobs: &VecDeque<AnalysisJob>) -> Result<()> {
        let snapshot: Vec<AnalysisJob> = jobs.iter().cloned().collect();
        self.store.save_queue(&snapshot)
    }
}
