//! Stream orchestrator: drives one conversation turn.
//!
//! A turn moves through `Streaming` and `AwaitingTools` until the model
//! produces a final answer, the tool-round limit is hit, or the machinery
//! fails. Tool results are always folded back into history before the model
//! is asked to continue — that ordering is the point of the whole system and
//! must never be relaxed.

use crate::coordinator::{Coordinator, ToolInvocation};
use crate::memory::{FinishedTurn, Memory, NoopMemory};
use crate::model::{Backend, FinishReason, Message, Part, StreamEvent, ToolResult, Usage};
use crate::registry::ToolRegistry;
use crate::session::Session;
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a memory recall may hold up turn open.
const MEMORY_RECALL_TIMEOUT: Duration = Duration::from_secs(2);

/// How a turn ended (short of a machinery failure).
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model produced a final answer.
    Completed {
        text: String,
        rounds: u32,
        usage: Usage,
    },
    /// The configured tool-round ceiling was hit while the model was still
    /// requesting tools.
    TurnLimitReached { rounds: u32 },
}

/// UI collaborator: receives stream fragments as they arrive.
///
/// Callbacks run on the turn's task and should return quickly.
pub trait TurnObserver: Send + Sync {
    fn text_delta(&self, _delta: &str) {}
    fn thinking_delta(&self, _delta: &str) {}
    fn tool_started(&self, _id: &str, _name: &str) {}
    fn tool_finished(&self, _name: &str, _result: &ToolResult) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl TurnObserver for NullObserver {}

/// Drives model turns against a registry snapshot and a session.
pub struct Orchestrator<B: Backend> {
    backend: B,
    registry: Arc<ToolRegistry>,
    memory: Arc<dyn Memory>,
}

impl<B: Backend> Orchestrator<B> {
    pub fn new(backend: B, registry: Arc<ToolRegistry>) -> Self {
        Self {
            backend,
            registry,
            memory: Arc::new(NoopMemory),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = memory;
        self
    }

    /// Run one full turn for `input`.
    ///
    /// The configuration and registry snapshot are captured once at turn
    /// open; a concurrent reload or config change affects the next turn.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: &str,
        observer: &dyn TurnObserver,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let config = session.config().clone();
        let snapshot = self.registry.current().await;
        let coordinator = Coordinator::new(config.concurrency, config.tool_timeout);

        let memory_context = if config.memory_enabled {
            self.recall_context(input).await
        } else {
            None
        };

        session.push_user(input)?;

        let mut usage = Usage::default();
        let mut rounds_done: u32 = 0;
        let mut all_results: Vec<ToolResult> = Vec::new();

        let final_text = loop {
            let mut messages = session.window(config.max_history);
            if let Some(context) = &memory_context {
                inject_context(&mut messages, context);
            }

            let request = crate::model::ModelRequest {
                model: &config.model,
                max_tokens: config.max_tokens,
                thinking_budget: config.thinking_budget,
                system: session.system(),
                messages: &messages,
                tools: snapshot.specs(),
            };

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                opened = self.backend.open(request) => opened?,
            };

            let mut text = String::new();
            let mut calls = Vec::new();
            let mut finish = FinishReason::Stop;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };

                match event? {
                    StreamEvent::TextDelta(delta) => {
                        observer.text_delta(&delta);
                        text.push_str(&delta);
                    }
                    StreamEvent::ThinkingDelta(delta) => observer.thinking_delta(&delta),
                    StreamEvent::ToolCallStarted { id, name } => observer.tool_started(&id, &name),
                    StreamEvent::ToolCall(call) => calls.push(call),
                    StreamEvent::Finished { reason, usage: u } => {
                        usage.add(u);
                        finish = reason;
                    }
                }
            }

            tracing::debug!(
                round = rounds_done,
                tool_calls = calls.len(),
                finish = ?finish,
                "model stream closed"
            );

            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(Part::Text(text.clone()));
            }
            parts.extend(calls.iter().cloned().map(Part::ToolCall));
            if !parts.is_empty() {
                session.push_assistant(parts, rounds_done)?;
            }

            if calls.is_empty() {
                break text;
            }

            if rounds_done >= config.max_tool_rounds {
                tracing::warn!(rounds = rounds_done, "tool-round limit reached");
                return Ok(TurnOutcome::TurnLimitReached {
                    rounds: rounds_done,
                });
            }

            // AwaitingTools: execute the batch, then fold results back into
            // history before the model continues.
            let batch: Vec<ToolInvocation> = calls
                .iter()
                .cloned()
                .map(|call| ToolInvocation::new(call, rounds_done))
                .collect();
            let results = coordinator
                .dispatch(batch, Arc::clone(&snapshot), cancel)
                .await;

            for (call, result) in calls.iter().zip(&results) {
                observer.tool_finished(&call.name, result);
            }

            all_results.extend(results.iter().cloned());
            session.push_tool_results(results)?;
            rounds_done += 1;

            if cancel.is_cancelled() {
                // Completed and abandoned results are already in history;
                // nothing half-written remains.
                return Err(Error::Cancelled);
            }
        };

        session.push_turn_completed(rounds_done, usage)?;

        if config.memory_enabled {
            self.offer_to_memory(FinishedTurn {
                session: session.id,
                input: input.to_string(),
                tool_results: all_results,
                answer: final_text.clone(),
            });
        }

        Ok(TurnOutcome::Completed {
            text: final_text,
            rounds: rounds_done,
            usage,
        })
    }

    async fn recall_context(&self, input: &str) -> Option<String> {
        match tokio::time::timeout(MEMORY_RECALL_TIMEOUT, self.memory.recall(input)).await {
            Ok(Ok(fragments)) if !fragments.is_empty() => Some(format!(
                "Relevant context from memory:\n{}",
                fragments.join("\n")
            )),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "memory recall failed");
                None
            }
            Err(_) => {
                tracing::debug!("memory recall timed out");
                None
            }
        }
    }

    /// Offer the finished turn to memory on a detached task.
    fn offer_to_memory(&self, turn: FinishedTurn) {
        let memory = Arc::clone(&self.memory);
        tokio::spawn(async move {
            if let Err(e) = memory.retain(turn).await {
                tracing::debug!(error = %e, "memory retain failed");
            }
        });
    }
}

/// Append recalled context to the most recent user text message, for this
/// model call only. Stored history is never rewritten.
fn inject_context(messages: &mut [Message], context: &str) {
    let target = messages.iter_mut().rev().find(|m| {
        m.role == crate::model::Role::User
            && m.parts.iter().any(|p| matches!(p, Part::Text(_)))
    });
    if let Some(message) = target {
        for part in message.parts.iter_mut().rev() {
            if let Part::Text(text) = part {
                text.push_str("\n\n");
                text.push_str(context);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryError;
    use crate::model::{EventStream, ModelError, ModelRequest, Role, ToolCall, ToolStatus};
    use crate::session::SessionConfig;
    use crate::tools::{LocalTool, ToolError};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use storage::EventStore;

    /// Backend that replays canned event scripts and records each request's
    /// message history.
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<std::result::Result<StreamEvent, ModelError>>>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<std::result::Result<StreamEvent, ModelError>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Backend for &ScriptedBackend {
        async fn open(&self, request: ModelRequest<'_>) -> std::result::Result<EventStream, ModelError> {
            self.requests
                .lock()
                .unwrap()
                .push(request.messages.to_vec());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Err(ModelError::Api("script exhausted".into()))]);
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    struct StaticTool {
        name: &'static str,
        reply: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl LocalTool for StaticTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> std::result::Result<Value, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(json!(self.reply))
        }
    }

    fn tool_call(id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolCall(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({}),
        })
    }

    fn finished(reason: FinishReason) -> StreamEvent {
        StreamEvent::Finished {
            reason,
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
        }
    }

    async fn registry_with(tools: Vec<Arc<dyn LocalTool>>) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new(tools, Vec::new()));
        registry.load().await;
        registry
    }

    fn session() -> Session {
        Session::new(EventStore::in_memory().unwrap(), SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn two_tools_dispatch_and_fold_back_before_the_final_answer() {
        let backend = ScriptedBackend::new(vec![
            vec![
                Ok(StreamEvent::TextDelta("Let me check.".into())),
                Ok(tool_call("c1", "calculator")),
                Ok(tool_call("c2", "search")),
                Ok(finished(FinishReason::ToolUse)),
            ],
            vec![
                Ok(StreamEvent::TextDelta("4, and ownership is...".into())),
                Ok(finished(FinishReason::Stop)),
            ],
        ]);
        let registry = registry_with(vec![
            Arc::new(StaticTool {
                name: "calculator",
                reply: "4",
                delay: Duration::from_millis(20),
            }),
            Arc::new(StaticTool {
                name: "search",
                reply: "rust ownership results",
                delay: Duration::from_millis(1),
            }),
        ])
        .await;

        let orchestrator = Orchestrator::new(&backend, registry);
        let mut session = session();
        let outcome = orchestrator
            .run_turn(
                &mut session,
                "what's 2+2, then search for 'rust ownership'",
                &NullObserver,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Completed { text, rounds, .. } => {
                assert_eq!(text, "4, and ownership is...");
                assert_eq!(rounds, 1);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        // The second model call saw exactly two tool results, correlated by
        // id and in submission order, before producing the final answer.
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        let fold_back = requests[1].last().unwrap();
        assert_eq!(fold_back.role, Role::User);
        let result_ids: Vec<&str> = fold_back
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult(r) => Some(r.call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, vec!["c1", "c2"]);

        // History: user, assistant(+2 calls), results, final assistant.
        assert_eq!(session.entries().len(), 4);
    }

    #[tokio::test]
    async fn endless_tool_requests_hit_the_turn_limit() {
        let round = || {
            vec![
                Ok(tool_call("c1", "calculator")),
                Ok(finished(FinishReason::ToolUse)),
            ]
        };
        let backend = ScriptedBackend::new(vec![round(), round(), round()]);
        let registry = registry_with(vec![Arc::new(StaticTool {
            name: "calculator",
            reply: "4",
            delay: Duration::from_millis(1),
        })])
        .await;

        let orchestrator = Orchestrator::new(&backend, registry);
        let mut session = session();
        let mut config = session.config().clone();
        config.max_tool_rounds = 2;
        session.set_config(config);

        let outcome = orchestrator
            .run_turn(
                &mut session,
                "loop forever",
                &NullObserver,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            TurnOutcome::TurnLimitReached { rounds: 2 }
        ));
        // user + (assistant + results) * 2 + final tool-requesting assistant
        assert_eq!(session.entries().len(), 6);
    }

    #[tokio::test]
    async fn model_error_fails_the_turn_cleanly() {
        let backend = ScriptedBackend::new(vec![vec![
            Ok(StreamEvent::TextDelta("partial".into())),
            Err(ModelError::Api("401: bad key".into())),
        ]]);
        let registry = registry_with(Vec::new()).await;

        let orchestrator = Orchestrator::new(&backend, registry);
        let mut session = session();
        let err = orchestrator
            .run_turn(
                &mut session,
                "hello",
                &NullObserver,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Model(ModelError::Api(_))));
        // Only the user entry landed; no partial assistant message.
        assert_eq!(session.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_dispatch_keeps_history_consistent() {
        let backend = ScriptedBackend::new(vec![vec![
            Ok(tool_call("c1", "glacial")),
            Ok(finished(FinishReason::ToolUse)),
        ]]);
        let registry = registry_with(vec![Arc::new(StaticTool {
            name: "glacial",
            reply: "too late",
            delay: Duration::from_secs(300),
        })])
        .await;

        let orchestrator = Orchestrator::new(&backend, registry);
        let mut session = session();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = orchestrator
            .run_turn(&mut session, "dig in", &NullObserver, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        // user, assistant, abandoned tool result — nothing half-written.
        assert_eq!(session.entries().len(), 3);
        match &session.entries()[2] {
            crate::session::Entry::ToolResults { results } => {
                assert_eq!(results[0].status, ToolStatus::Error);
                assert!(results[0].payload.contains("cancelled"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    struct RecordingMemory {
        recalled: Vec<String>,
        retained: Mutex<Vec<FinishedTurn>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl Memory for RecordingMemory {
        async fn recall(&self, _query: &str) -> std::result::Result<Vec<String>, MemoryError> {
            Ok(self.recalled.clone())
        }
        async fn retain(&self, turn: FinishedTurn) -> std::result::Result<(), MemoryError> {
            self.retained.lock().unwrap().push(turn);
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_context_is_injected_without_rewriting_history() {
        let backend = ScriptedBackend::new(vec![vec![
            Ok(StreamEvent::TextDelta("You like Rust.".into())),
            Ok(finished(FinishReason::Stop)),
        ]]);
        let registry = registry_with(Vec::new()).await;
        let memory = Arc::new(RecordingMemory {
            recalled: vec!["The user's favorite language is Rust.".into()],
            retained: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });

        let orchestrator = Orchestrator::new(&backend, registry).with_memory(memory.clone());
        let mut session = session();
        let mut config = session.config().clone();
        config.memory_enabled = true;
        session.set_config(config);

        orchestrator
            .run_turn(
                &mut session,
                "what do I like?",
                &NullObserver,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sent = &backend.requests()[0];
        assert!(sent.last().unwrap().text().contains("favorite language"));
        // Stored history keeps the raw input only.
        match &session.entries()[0] {
            crate::session::Entry::User { text } => assert_eq!(text, "what do I like?"),
            other => panic!("expected user entry, got {other:?}"),
        }

        // The finished turn is offered asynchronously.
        memory.notify.notified().await;
        let retained = memory.retained.lock().unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].answer, "You like Rust.");
    }

    #[tokio::test]
    async fn observer_sees_streamed_fragments() {
        struct CollectingObserver {
            text: Mutex<String>,
            tools: Mutex<Vec<String>>,
        }
        impl TurnObserver for CollectingObserver {
            fn text_delta(&self, delta: &str) {
                self.text.lock().unwrap().push_str(delta);
            }
            fn tool_started(&self, _id: &str, name: &str) {
                self.tools.lock().unwrap().push(name.to_string());
            }
        }

        let backend = ScriptedBackend::new(vec![
            vec![
                Ok(StreamEvent::TextDelta("Wor".into())),
                Ok(StreamEvent::ToolCallStarted {
                    id: "c1".into(),
                    name: "clock".into(),
                }),
                Ok(tool_call("c1", "clock")),
                Ok(finished(FinishReason::ToolUse)),
            ],
            vec![
                Ok(StreamEvent::TextDelta("king.".into())),
                Ok(finished(FinishReason::Stop)),
            ],
        ]);
        let registry = registry_with(vec![Arc::new(StaticTool {
            name: "clock",
            reply: "noon",
            delay: Duration::from_millis(1),
        })])
        .await;

        let observer = CollectingObserver {
            text: Mutex::new(String::new()),
            tools: Mutex::new(Vec::new()),
        };
        let orchestrator = Orchestrator::new(&backend, registry);
        let mut session = session();
        orchestrator
            .run_turn(
                &mut session,
                "what time is it?",
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(*observer.text.lock().unwrap(), "Working.");
        assert_eq!(*observer.tools.lock().unwrap(), vec!["clock"]);
    }
}
