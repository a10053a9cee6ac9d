// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios for the session turn loop and turn executor.
///
/// Uses ScriptedMockProvider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod scenario_tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use foreman_config::{AgentConfig, ToolsConfig};
    use foreman_model::{MessageContent, ResponseEvent, Role, ScriptedMockProvider};
    use foreman_tools::{ShellTool, Tool, ToolCall, ToolOutput, ToolRegistry};

    use crate::{
        AgentEvent, ApprovalGate, AsyncEvent, AutoDenyPrompt, Dispatcher, ProcessOptions, Services,
        Session, TurnExecutor, TurnOutcome,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn yolo_gate() -> Arc<ApprovalGate> {
        Arc::new(ApprovalGate::new(
            &ToolsConfig {
                yolo: true,
                ..Default::default()
            },
            Arc::new(AutoDenyPrompt),
        ))
    }

    fn session_with(
        model: ScriptedMockProvider,
        registry: ToolRegistry,
        config: AgentConfig,
    ) -> Session {
        let dispatcher = Dispatcher::new(Arc::new(registry), yolo_gate());
        Session::new(
            Arc::new(model),
            dispatcher,
            Arc::new(config),
            Arc::new(Services::new(None)),
        )
    }

    fn shell_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        reg
    }

    /// Drain the channel into a Vec of events, stopping at TurnComplete or
    /// channel close.
    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            let Some(ev) = ev else { break };
            let done = matches!(ev, AgentEvent::TurnComplete);
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    // ── Scenario 1: simple text turn ──────────────────────────────────────────

    #[tokio::test]
    async fn simple_text_turn_appends_two_messages_and_emits_c() {
        let _guard = crate::test_sync::lock();
        let session = session_with(
            ScriptedMockProvider::always_text("hi"),
            ToolRegistry::new(),
            AgentConfig::default(),
        );
        let mut ex = TurnExecutor::new(session).unwrap();
        let (tx, rx) = mpsc::channel(64);
        ex.start("hello".into(), tx).await.unwrap();
        assert!(ex.wait(Duration::from_secs(5)).await);

        assert_eq!(ex.result(), TurnOutcome::Ok);
        assert_eq!(ex.process_events(), Some(AsyncEvent::Complete));

        let session = ex.session();
        let guard = session.lock().await;
        assert_eq!(guard.messages.len(), 2);
        assert_eq!(guard.messages[0].role, Role::User);
        assert_eq!(guard.messages[1].as_text(), Some("hi"));

        let events = collect_events(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::TextComplete(t) if t == "hi")));
    }

    // ── Scenario 2: tool round then text ──────────────────────────────────────

    #[tokio::test]
    async fn tool_round_then_text_yields_four_messages() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1",
            "shell_execute",
            r#"{"command":"printf 'a\nb\n'"}"#,
            "I see a and b.",
        );
        let mut session = session_with(model, shell_registry(), AgentConfig::default());
        let (tx, rx) = mpsc::channel(64);
        let outcome = session.process_simple("list files", tx).await;

        assert_eq!(outcome, TurnOutcome::Ok);
        // user + assistant tool-call + tool result + assistant text
        assert_eq!(session.messages.len(), 4);
        match &session.messages[2].content {
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "tc-1");
                assert!(content.contains('a') && content.contains('b'));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(session.messages[3].as_text(), Some("I see a and b."));

        let events = collect_events(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallFinished { tool_name, .. }
                if tool_name == "shell_execute")));
    }

    // ── Scenario 3: cancellation mid-turn ─────────────────────────────────────

    #[tokio::test]
    async fn cancellation_mid_shell_records_interrupted_and_stops() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "tc-1".into(),
                    name: "shell_execute".into(),
                    arguments: r#"{"command":"sleep 60"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            // Would be round 2; must never be consumed.
            vec![
                ResponseEvent::TextDelta("should not happen".into()),
                ResponseEvent::Done,
            ],
        ]);
        let session = session_with(model, shell_registry(), AgentConfig::default());
        let mut ex = TurnExecutor::new(session).unwrap();
        let (tx, _rx) = mpsc::channel(256);
        ex.start("run forever".into(), tx).await.unwrap();

        // Give the worker time to reach the shell, then cancel.
        tokio::time::sleep(Duration::from_millis(300)).await;
        ex.cancel();
        assert!(ex.wait(Duration::from_secs(10)).await);

        assert_eq!(ex.result(), TurnOutcome::Cancelled);
        assert_eq!(ex.process_events(), Some(AsyncEvent::Interrupted));

        let session = ex.session();
        let guard = session.lock().await;
        let interrupted_result = guard.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { content, .. }
                if content == "interrupted")
        });
        assert!(interrupted_result, "tool result must record the interruption");
        // No further model round-trip happened.
        let assistant_texts = guard
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.as_text().is_some())
            .count();
        assert_eq!(assistant_texts, 0);
        foreman_tools::interrupt::clear_interrupt();
    }

    // ── Scenario 4: denial flows to the model, turn continues ─────────────────

    #[tokio::test]
    async fn denied_tool_call_produces_error_result_and_turn_continues() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1",
            "shell_execute",
            r#"{"command":"rm -rf /"}"#,
            "understood, not doing that",
        );
        // Real gate with auto-deny prompt (headless), no yolo.
        let dispatcher = Dispatcher::new(
            Arc::new(shell_registry()),
            Arc::new(ApprovalGate::new(
                &ToolsConfig::default(),
                Arc::new(AutoDenyPrompt),
            )),
        );
        let mut session = Session::new(
            Arc::new(model),
            dispatcher,
            Arc::new(AgentConfig::default()),
            Arc::new(Services::new(None)),
        );
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session
            .process("wipe the disk", ProcessOptions::default(), tx, &AtomicBool::new(false))
            .await;

        assert_eq!(outcome, TurnOutcome::Ok);
        let denial = session.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { content, .. }
                if content.contains("denied"))
        });
        assert!(denial, "the model must see the denial as a tool result");
        assert_eq!(
            session.messages.last().unwrap().as_text(),
            Some("understood, not doing that")
        );
    }

    // ── Invariant: every call gets exactly one matching result ────────────────

    #[tokio::test]
    async fn parallel_batch_results_match_calls_one_to_one_in_order() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "tc-a".into(),
                    name: "shell_execute".into(),
                    arguments: r#"{"command":"echo one"}"#.into(),
                },
                ResponseEvent::ToolCall {
                    index: 1,
                    id: "tc-b".into(),
                    name: "shell_execute".into(),
                    arguments: r#"{"command":"echo two"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("both ran".into()), ResponseEvent::Done],
        ]);
        let mut session = session_with(model, shell_registry(), AgentConfig::default());
        let (tx, _rx) = mpsc::channel(256);
        let outcome = session.process_simple("run both", tx).await;
        assert_eq!(outcome, TurnOutcome::Ok);

        let call_ids: Vec<&str> = session
            .messages
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        let result_ids: Vec<&str> = session
            .messages
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(call_ids, vec!["tc-a", "tc-b"]);
        assert_eq!(result_ids, call_ids, "results must match calls in order");
    }

    // ── Boundary: tool round cap ──────────────────────────────────────────────

    #[tokio::test]
    async fn tool_loop_terminates_at_round_cap_with_system_message() {
        let _guard = crate::test_sync::lock();
        // Every round returns another tool call; the cap must end the turn.
        let round = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc".into(),
                name: "shell_execute".into(),
                arguments: r#"{"command":"true"}"#.into(),
            },
            ResponseEvent::Done,
        ];
        let model = ScriptedMockProvider::new(vec![round.clone(), round.clone(), round]);
        let config = AgentConfig {
            max_tool_rounds: 2,
            ..Default::default()
        };
        let mut session = session_with(model, shell_registry(), config);
        let (tx, _rx) = mpsc::channel(256);
        let outcome = session.process_simple("loop forever", tx).await;

        assert_eq!(outcome, TurnOutcome::Ok);
        let cap_message = session.messages.iter().any(|m| {
            m.role == Role::System
                && m.as_text().is_some_and(|t| t.contains("round limit"))
        });
        assert!(cap_message, "cap must be explained in a system message");
    }

    // ── Unknown tool and bad arguments ────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_yields_error_result_not_turn_failure() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1",
            "no_such_tool",
            r#"{}"#,
            "giving up on that tool",
        );
        let mut session = session_with(model, ToolRegistry::new(), AgentConfig::default());
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session.process_simple("try it", tx).await;
        assert_eq!(outcome, TurnOutcome::Ok);
        let unknown = session.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { content, .. }
                if content.contains("unknown tool"))
        });
        assert!(unknown);
    }

    #[tokio::test]
    async fn invalid_argument_json_yields_bad_arguments_result() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::tool_then_text(
            "tc-1",
            "shell_execute",
            "{not valid json",
            "noted",
        );
        let mut session = session_with(model, shell_registry(), AgentConfig::default());
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session.process_simple("go", tx).await;
        assert_eq!(outcome, TurnOutcome::Ok);
        let bad_args = session.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { content, .. }
                if content.contains("bad arguments"))
        });
        assert!(bad_args);
    }

    // ── Context exhaustion and failure ────────────────────────────────────────

    #[tokio::test]
    async fn context_exhaustion_maps_to_its_result_code() {
        let _guard = crate::test_sync::lock();
        let mut session = session_with(
            ScriptedMockProvider::always_fail("provider error 400: context_length_exceeded"),
            ToolRegistry::new(),
            AgentConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session.process_simple("hello", tx).await;
        assert_eq!(outcome, TurnOutcome::ContextExhausted);
        assert_eq!(outcome.code(), -3);
    }

    #[tokio::test]
    async fn http_failure_does_not_extend_conversation() {
        let _guard = crate::test_sync::lock();
        let mut session = session_with(
            ScriptedMockProvider::always_fail("connection refused"),
            ToolRegistry::new(),
            AgentConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session.process_simple("hello", tx).await;
        assert_eq!(outcome, TurnOutcome::Failure);
        // Only the user message was appended; no assistant turn.
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::User);
    }

    // ── clear_history signal ──────────────────────────────────────────────────

    struct ResetTool;

    #[async_trait]
    impl Tool for ResetTool {
        fn name(&self) -> &str {
            "session_reset"
        }
        fn description(&self) -> &str {
            "clears conversation history"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn category(&self) -> &str {
            "agent"
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "history cleared").with_clear_history()
        }
    }

    #[tokio::test]
    async fn clear_history_retains_batch_and_drops_earlier_turns() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::new(vec![
            vec![ResponseEvent::TextDelta("first reply".into()), ResponseEvent::Done],
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "tc-r".into(),
                    name: "session_reset".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("fresh start".into()), ResponseEvent::Done],
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(ResetTool);
        let mut session = session_with(model, reg, AgentConfig::default());
        session = session.with_system_prompt("you are foreman");

        let (tx, _rx) = mpsc::channel(64);
        assert_eq!(session.process_simple("turn one", tx).await, TurnOutcome::Ok);
        let (tx, _rx) = mpsc::channel(64);
        assert_eq!(session.process_simple("reset now", tx).await, TurnOutcome::Ok);

        // Kept: system, the reset tool-call batch, its result, and the
        // follow-up assistant text.  Dropped: both earlier turns.
        assert_eq!(session.messages[0].role, Role::System);
        assert!(!session
            .messages
            .iter()
            .any(|m| m.as_text() == Some("turn one")));
        assert!(!session
            .messages
            .iter()
            .any(|m| m.as_text() == Some("first reply")));
        assert!(session.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::ToolResult { content, .. }
                if content == "history cleared")
        }));
        assert_eq!(session.messages.last().unwrap().as_text(), Some("fresh start"));
    }

    // ── Suppressed user append (supervisor path) ──────────────────────────────

    #[tokio::test]
    async fn suppressed_append_runs_on_staged_history() {
        let _guard = crate::test_sync::lock();
        let model = ScriptedMockProvider::always_text("reacting");
        let mut session = session_with(model, ToolRegistry::new(), AgentConfig::default());
        session.push(foreman_model::Message::user("staged notification"));
        let (tx, _rx) = mpsc::channel(64);
        let outcome = session
            .process(
                "ignored",
                ProcessOptions { append_user: false },
                tx,
                &AtomicBool::new(false),
            )
            .await;
        assert_eq!(outcome, TurnOutcome::Ok);
        // Exactly one user message: the staged one.
        let users = session
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        assert_eq!(users, 1);
    }
}
