use crate::orchestrator::AnalysisOrchestrator;
use crate::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const IDLE_POLL: Duration = Duration::from_millis(500);

/// 队列消费循环。启动时恢复中断的文档状态，然后轮询队列。
/// 单个任务的失败已在编排器里落盘，循环本身不会退出。
pub async fn run_queue(orchestrator: Arc<AnalysisOrchestrator>, queue: Arc<JobQueue>) {
    match orchestrator.store().recover_in_flight() {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "reset interrupted documents on startup"),
        Err(e) => error!(error = %e, "failed to recover in-flight documents"),
    }

    loop {
        match queue.peek().await {
            Some(job) => {
                info!(document_id = %job.document_id, provider = %job.provider, "job picked from queue");
                // 错误已由编排器记录并写入文档状态；
                // 跑完才 ack 出队，中途崩溃时任务留在队列里重跑
                let _ = orchestrator.run(&job).await;
                if let Err(e) = queue.ack(job.document_id).await {
                    error!(error = %e, "failed to ack completed job");
                }
            }
            None => tokio::time::sleep(IDLE_POLL).await,
        }
    }
}
