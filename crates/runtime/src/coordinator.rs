//! Execution coordinator: runs one batch of tool invocations.
//!
//! Invocations execute concurrently up to a bounded ceiling, but the returned
//! result list always matches the submission order, because downstream
//! fold-back and logging expect deterministic ordering. Every failure mode
//! becomes a [`ToolResult`]; nothing a tool does can crash the dispatch.

use crate::model::{ToolCall, ToolResult};
use crate::registry::RegistrySnapshot;
use crate::tools::ToolError;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One tool request emitted by the model mid-stream.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub call: ToolCall,
    /// Tool round within the turn that emitted this invocation.
    pub round: u32,
}

impl ToolInvocation {
    pub fn new(call: ToolCall, round: u32) -> Self {
        Self { call, round }
    }
}

/// Schedules tool execution for one turn.
#[derive(Debug, Clone)]
pub struct Coordinator {
    concurrency: usize,
    call_timeout: Duration,
}

impl Coordinator {
    pub fn new(concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    /// Execute a batch, returning one result per invocation in submission
    /// order.
    ///
    /// No retries happen here: a failed or timed-out call is reported as-is
    /// and the model's next round may reissue it.
    pub async fn dispatch(
        &self,
        batch: Vec<ToolInvocation>,
        snapshot: Arc<RegistrySnapshot>,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        if batch.is_empty() {
            return Vec::new();
        }

        tracing::debug!(
            batch = batch.len(),
            registry_version = snapshot.version(),
            "dispatching tool batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let work: Vec<_> = batch
            .into_iter()
            .map(|invocation| {
                self.run_one(
                    invocation,
                    Arc::clone(&snapshot),
                    Arc::clone(&semaphore),
                    cancel.clone(),
                )
            })
            .collect();

        // join_all preserves submission order regardless of completion order.
        join_all(work).await
    }

    async fn run_one(
        &self,
        invocation: ToolInvocation,
        snapshot: Arc<RegistrySnapshot>,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let ToolInvocation { call, round } = invocation;
        let started = Instant::now();

        let Some(binding) = snapshot.get(&call.name) else {
            return ToolResult::error(
                call.id,
                format!("tool not found: {}", call.name),
                started.elapsed(),
            );
        };

        // Validation failures never reach the tool body.
        if let Err(e) = binding.validate(&call.input) {
            tracing::debug!(tool = %call.name, round, error = %e, "argument validation failed");
            return ToolResult::error(call.id, e.to_string(), started.elapsed());
        }

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return ToolResult::error(call.id, "dispatch queue closed", started.elapsed());
                }
            },
            _ = cancel.cancelled() => {
                return ToolResult::error(call.id, "cancelled before execution", started.elapsed());
            }
        };

        // Run on a detached task so a deadline overrun abandons the work
        // instead of waiting it out; any late result is discarded.
        let execution = binding.invoke(call.input.clone(), self.call_timeout);
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            execution.await
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                handle.abort();
                tracing::debug!(tool = %call.name, "tool call cancelled");
                return ToolResult::error(call.id, "cancelled during execution", started.elapsed());
            }
            outcome = tokio::time::timeout(self.call_timeout, &mut handle) => outcome,
        };

        match outcome {
            Err(_) => {
                handle.abort();
                tracing::warn!(tool = %call.name, timeout_ms = self.call_timeout.as_millis() as u64, "tool call exceeded deadline");
                ToolResult::timeout(call.id, started.elapsed())
            }
            Ok(Ok(Ok(payload))) => ToolResult::ok(call.id, payload, started.elapsed()),
            Ok(Ok(Err(ToolError::Timeout(_)))) => ToolResult::timeout(call.id, started.elapsed()),
            Ok(Ok(Err(error))) => {
                tracing::debug!(tool = %call.name, error = %error, "tool execution failed");
                ToolResult::error(call.id, error.to_string(), started.elapsed())
            }
            Ok(Err(join_error)) => ToolResult::error(
                call.id,
                format!("tool task failed: {join_error}"),
                started.elapsed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolStatus;
    use crate::registry::build_snapshot;
    use crate::tools::LocalTool;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct SleepTool {
        name: &'static str,
        delay: Duration,
        completed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LocalTool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps then answers"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(self.delay).await;
            self.completed.store(true, Ordering::SeqCst);
            Ok(json!(self.name))
        }
    }

    struct StrictTool {
        executed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LocalTool for StrictTool {
        fn name(&self) -> &str {
            "strict"
        }
        fn description(&self) -> &str {
            "requires a numeric x"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"x": {"type": "number"}},
                "required": ["x"]
            })
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(json!("ran"))
        }
    }

    fn call(id: &str, name: &str, input: Value) -> ToolInvocation {
        ToolInvocation::new(
            ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            },
            0,
        )
    }

    fn snapshot_of(tools: Vec<Arc<dyn LocalTool>>) -> Arc<RegistrySnapshot> {
        Arc::new(build_snapshot(1, &tools, Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn results_preserve_submission_order() {
        let snapshot = snapshot_of(vec![
            Arc::new(SleepTool {
                name: "slow",
                delay: Duration::from_millis(200),
                completed: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(SleepTool {
                name: "fast",
                delay: Duration::from_millis(1),
                completed: Arc::new(AtomicBool::new(false)),
            }),
        ]);

        let coordinator = Coordinator::new(4, Duration::from_secs(5));
        let results = coordinator
            .dispatch(
                vec![
                    call("c1", "slow", json!({})),
                    call("c2", "fast", json!({})),
                ],
                snapshot,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        // "fast" finishes first, but the list order follows submission.
        assert_eq!(results[0].call_id, "c1");
        assert_eq!(results[1].call_id, "c2");
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn validation_failure_never_executes_the_tool() {
        let executed = Arc::new(AtomicBool::new(false));
        let snapshot = snapshot_of(vec![Arc::new(StrictTool {
            executed: Arc::clone(&executed),
        })]);

        let coordinator = Coordinator::new(4, Duration::from_secs(5));
        let results = coordinator
            .dispatch(
                vec![call("c1", "strict", json!({"x": "not a number"}))],
                snapshot,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ToolStatus::Error);
        assert!(results[0].payload.contains("invalid input"));
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_tool_reports_error() {
        let snapshot = snapshot_of(Vec::new());
        let coordinator = Coordinator::new(4, Duration::from_secs(5));
        let results = coordinator
            .dispatch(
                vec![call("c1", "ghost", json!({}))],
                snapshot,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ToolStatus::Error);
        assert!(results[0].payload.contains("tool not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_overrun_becomes_timeout_and_late_result_is_discarded() {
        let completed = Arc::new(AtomicBool::new(false));
        let snapshot = snapshot_of(vec![Arc::new(SleepTool {
            name: "glacial",
            delay: Duration::from_secs(60),
            completed: Arc::clone(&completed),
        })]);

        let coordinator = Coordinator::new(4, Duration::from_millis(50));
        let results = coordinator
            .dispatch(
                vec![call("c1", "glacial", json!({}))],
                snapshot,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ToolStatus::Timeout);

        // The abandoned task never completes into the result set.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_is_respected() {
        struct CountingTool {
            live: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl LocalTool for CountingTool {
            fn name(&self) -> &str {
                "counting"
            }
            fn description(&self) -> &str {
                "tracks concurrent executions"
            }
            fn schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
                let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(live, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.live.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        }

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let snapshot = snapshot_of(vec![Arc::new(CountingTool {
            live: Arc::clone(&live),
            peak: Arc::clone(&peak),
        })]);

        let coordinator = Coordinator::new(2, Duration::from_secs(5));
        let batch = (0..6)
            .map(|i| call(&format!("c{i}"), "counting", json!({})))
            .collect();
        let results = coordinator
            .dispatch(batch, snapshot, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_work() {
        let snapshot = snapshot_of(vec![Arc::new(SleepTool {
            name: "slow",
            delay: Duration::from_secs(60),
            completed: Arc::new(AtomicBool::new(false)),
        })]);

        let coordinator = Coordinator::new(4, Duration::from_secs(120));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let results = coordinator
            .dispatch(vec![call("c1", "slow", json!({}))], snapshot, &cancel)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ToolStatus::Error);
        assert!(results[0].payload.contains("cancelled"));
    }
}
