use std::sync::Mutex;

use crate::model::{ReportKind, Traces};

/// One unit of report work. Tasks re-enter the pool on transient failures
/// until the retry budget is spent.
#[derive(Debug)]
pub struct TraceTask {
    pub traces: Traces,
    pub kind: ReportKind,
    pub retry_count: u32,
    pub check_time: i64,
}

impl TraceTask {
    pub fn new(traces: Traces, kind: ReportKind) -> TraceTask {
        TraceTask {
            traces,
            kind,
            retry_count: 0,
            check_time: 0,
        }
    }
}

struct PoolInner {
    ready: Vec<TraceTask>,
    retry: Vec<TraceTask>,
}

/// Two-queue task pool: a FIFO ready queue plus a retry queue kept ordered
/// by check time (retries share the same period, so appends preserve the
/// order).
pub struct TaskPool {
    inner: Mutex<PoolInner>,
    retry_period: i64,
}

impl TaskPool {
    pub fn new(retry_period: i64) -> TaskPool {
        let retry_period = if retry_period <= 0 { 5 } else { retry_period };
        TaskPool {
            inner: Mutex::new(PoolInner {
                ready: Vec::new(),
                retry: Vec::new(),
            }),
            retry_period,
        }
    }

    pub fn add(&self, task: TraceTask) {
        tracing::info!(
            kind = %task.kind,
            trace_id = task.traces.trace_id,
            trace_count = task.traces.trace_count(),
            "add report task"
        );
        self.inner.lock().unwrap().ready.push(task);
    }

    pub fn retry(&self, mut task: TraceTask) {
        task.retry_count += 1;
        task.check_time = chrono::Utc::now().timestamp() + self.retry_period;
        self.inner.lock().unwrap().retry.push(task);
    }

    /// All ready tasks plus the due prefix of the retry queue.
    pub fn drain(&self, check_time: i64) -> Vec<TraceTask> {
        let mut inner = self.inner.lock().unwrap();
        let mut tasks: Vec<TraceTask> = inner.ready.drain(..).collect();

        let due = inner
            .retry
            .iter()
            .take_while(|task| task.check_time <= check_time)
            .count();
        tasks.extend(inner.retry.drain(..due));

        if !tasks.is_empty() || !inner.retry.is_empty() {
            tracing::info!(
                processed = tasks.len(),
                left = inner.retry.len(),
                "drain report tasks"
            );
        }
        tasks
    }

    pub fn pending(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.ready.len(), inner.retry.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(trace_id: &str, kind: ReportKind) -> TraceTask {
        TraceTask::new(Traces::new(trace_id), kind)
    }

    #[test]
    fn test_drain_takes_ready_fifo() {
        let pool = TaskPool::new(5);
        pool.add(task("t1", ReportKind::Slow));
        pool.add(task("t2", ReportKind::Error));

        let drained = pool.drain(chrono::Utc::now().timestamp());
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].traces.trace_id, "t1");
        assert_eq!(drained[1].traces.trace_id, "t2");
        assert!(pool.drain(chrono::Utc::now().timestamp()).is_empty());
    }

    #[test]
    fn test_retry_count_monotone_and_delayed() {
        let pool = TaskPool::new(5);
        let now = chrono::Utc::now().timestamp();
        pool.retry(task("t1", ReportKind::Slow));

        // Not due yet.
        assert!(pool.drain(now).is_empty());

        let drained = pool.drain(now + 6);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].retry_count, 1);

        // A second retry keeps incrementing.
        pool.retry(drained.into_iter().next().unwrap());
        let drained = pool.drain(now + 12);
        assert_eq!(drained[0].retry_count, 2);
    }

    #[test]
    fn test_drain_takes_due_retry_prefix_only() {
        let pool = TaskPool::new(5);
        pool.retry(task("due", ReportKind::Slow));
        {
            let mut inner = pool.inner.lock().unwrap();
            inner.retry[0].check_time = 10;
            let mut later = task("later", ReportKind::Slow);
            later.check_time = 100;
            later.retry_count = 1;
            inner.retry.push(later);
        }

        let drained = pool.drain(50);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].traces.trace_id, "due");
        assert_eq!(pool.pending(), (0, 1));
    }

    #[test]
    fn test_default_retry_period() {
        let pool = TaskPool::new(0);
        assert_eq!(pool.retry_period, 5);
    }
}
