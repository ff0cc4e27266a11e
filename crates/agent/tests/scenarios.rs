//! End-to-end conversation scenarios against scripted backends.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parley_agent::Orchestrator;
use parley_agent::context::{
    ContextManager, HeuristicCounter, HierarchicalSelector, PRIOR_HISTORY_INSTRUCTION,
    SUMMARIES_LABEL,
};
use parley_agent::orchestrator::{
    CONTEXT_RECALL_TAG, SESSION_NOTICE_TAG, TOOL_CEILING_MESSAGE, TOOL_RESULT_TAG, TOOL_USE_TAG,
};
use parley_config::AppConfig;
use parley_core::backend::{Backend, BackendRequest, BackendResponse, ChatRole};
use parley_core::error::{BackendError, Error, ErrorKind};
use parley_core::message::{Importance, LOADED_FROM_DISK_TAG, Message, Role, Summary, TimeSpan};
use parley_core::tool::ToolCall;
use parley_providers::MockBackend;
use parley_store::{FileSessionStore, SessionStore};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn offline_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.persistence.enabled = false;
    config.summarizer.async_mode = false;
    config
}

async fn orchestrator(config: AppConfig, backend: Arc<MockBackend>) -> Orchestrator {
    Orchestrator::builder(config)
        .with_backend(backend)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn plain_reply() {
    let backend = Arc::new(MockBackend::new().with_reply("Hello! How can I help?"));
    let orch = orchestrator(offline_config(), backend.clone()).await;

    let reply = orch.send_user_message("Hi there").await.unwrap();
    assert_eq!(reply, "Hello! How can I help?");

    let history = orch.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "Hi there");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Hello! How can I help?");

    let request = &backend.requests()[0];
    assert_eq!(request.messages[0].role, ChatRole::System);
    assert!(request.options.tool_results.is_empty());
    orch.close().await.unwrap();
}

#[tokio::test]
async fn single_tool_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), "").unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    let backend = Arc::new(
        MockBackend::new()
            .with_tool_call("directory_list", json!({ "path": path }))
            .with_reply("The directory contains one file, a."),
    );
    let orch = orchestrator(offline_config(), backend.clone()).await;

    let reply = orch.send_user_message("What is in the folder?").await.unwrap();
    assert_eq!(reply, "The directory contains one file, a.");

    let history = orch.history();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::System, Role::Assistant]
    );
    assert!(history[1].has_tag(TOOL_USE_TAG));
    assert!(history[1].content.starts_with("Using tool: directory_list with input:"));
    assert!(history[2].has_tag(TOOL_RESULT_TAG));
    assert!(history[2].has_tag("tool:directory_list"));
    assert!(history[2].content.contains(r#""name":"a""#));

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].options.tool_results.is_empty());
    let results = &requests[1].options.tool_results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_name, "directory_list");
    assert!(!results[0].is_error);
    orch.close().await.unwrap();
}

#[tokio::test]
async fn tool_loop_stops_at_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let backend = Arc::new(MockBackend::new().with_fallback(BackendResponse::tool_use(
        ToolCall::new("directory_list", json!({ "path": path })),
    )));
    let mut config = offline_config();
    config.tools.max_iterations = 3;
    let orch = orchestrator(config, backend.clone()).await;

    let reply = orch.send_user_message("Keep looking").await.unwrap();
    assert_eq!(reply, TOOL_CEILING_MESSAGE);
    assert_eq!(backend.call_count(), 3);

    let history = orch.history();
    assert_eq!(history.len(), 8);
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::System);
    assert_eq!(last.content, TOOL_CEILING_MESSAGE);
    orch.close().await.unwrap();
}

#[tokio::test]
async fn summaries_replace_covered_messages_but_keep_critical() {
    let primary = Arc::new(MockBackend::new());
    let summarizer = Arc::new(
        MockBackend::new()
            .with_model("summary-model")
            .with_reply("The user shared a deploy key rule and asked two questions."),
    );
    let mut config = offline_config();
    config.context.hierarchical.auto_summarize_threshold = 4;
    let orch = Orchestrator::builder(config)
        .with_backend(primary.clone())
        .with_summarizer_backend(summarizer.clone())
        .build()
        .await
        .unwrap();

    orch.send_user_message("This is urgent: never commit the deploy key.")
        .await
        .unwrap();
    orch.send_user_message("second question").await.unwrap();
    orch.send_user_message("third question").await.unwrap();

    assert_eq!(summarizer.call_count(), 1);
    assert_eq!(orch.context_statistics()["summary_count"], json!(1));
    let history = orch.history();
    assert_eq!(history[0].level(), Importance::Critical);

    let request = &primary.requests()[2];
    let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents[1].starts_with(SUMMARIES_LABEL));
    assert!(contents[1].contains("deploy key rule"));
    // The Critical source survives summarization; the others are replaced
    assert!(contents.contains(&"This is urgent: never commit the deploy key."));
    assert!(!contents.contains(&"second question"));
    assert_eq!(*contents.last().unwrap(), "third question");
    orch.close().await.unwrap();
}

#[tokio::test]
async fn session_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.summarizer.async_mode = false;
    config.persistence.directory = dir.path().to_path_buf();

    let first = orchestrator(config.clone(), Arc::new(MockBackend::new())).await;
    first.send_user_message("My project is called Falcon.").await.unwrap();
    first.send_user_message("It ships in March.").await.unwrap();
    let session_id = first.session_id().unwrap();
    first.close().await.unwrap();

    let backend = Arc::new(MockBackend::new());
    let second = orchestrator(config, backend.clone()).await;
    let history = second.history();
    assert_eq!(history.len(), 5);
    assert!(history[..4].iter().all(|m| m.has_tag(LOADED_FROM_DISK_TAG)));
    assert_eq!(history[0].content, "My project is called Falcon.");
    let notice = &history[4];
    assert_eq!(notice.role, Role::System);
    assert!(notice.is_critical());
    assert!(notice.has_tag(SESSION_NOTICE_TAG));
    assert_eq!(second.session_id().as_deref(), Some(session_id.as_str()));

    second
        .send_user_message("What did we discuss earlier about the project?")
        .await
        .unwrap();
    assert!(second.history().iter().any(|m| m.has_tag(CONTEXT_RECALL_TAG)));
    let request = &backend.requests()[0];
    assert!(request.messages[0].content.contains(PRIOR_HISTORY_INSTRUCTION));
    assert!(
        request
            .messages
            .iter()
            .any(|m| m.content == "My project is called Falcon.")
    );
    second.close().await.unwrap();

    let store = FileSessionStore::new(dir.path(), true);
    let sessions = store.list().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session_id);
    assert_eq!(sessions[0].message_count, 8);
}

/// Hangs on its first call, answers immediately afterwards.
struct SlowOnceBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl Backend for SlowOnceBackend {
    fn name(&self) -> &str {
        "slow-once"
    }

    fn model_id(&self) -> &str {
        "slow-once-model"
    }

    async fn send(&self, _request: BackendRequest) -> Result<BackendResponse, BackendError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }
        Ok(BackendResponse::text("back online"))
    }
}

#[tokio::test(start_paused = true)]
async fn backend_timeout_fails_turn_without_reply() {
    let mut config = offline_config();
    config.backend.timeout_secs = 1;
    let orch = Orchestrator::builder(config)
        .with_backend(Arc::new(SlowOnceBackend {
            calls: AtomicUsize::new(0),
        }))
        .build()
        .await
        .unwrap();

    let err = orch.send_user_message("Are you there?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(matches!(
        err,
        Error::Backend(BackendError::Timeout { timeout_secs: 1 })
    ));
    let history = orch.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);

    let reply = orch.send_user_message("Try again").await.unwrap();
    assert_eq!(reply, "back online");
    assert_eq!(orch.history().len(), 3);
    orch.close().await.unwrap();
}

#[test]
fn hierarchical_selection_keeps_summary_critical_and_recent() {
    let config = AppConfig::default();
    let manager = Arc::new(ContextManager::new(
        Arc::new(HeuristicCounter),
        &config.context,
    ));
    let selector = HierarchicalSelector::new(manager.clone(), config.context.hierarchical);

    // 30 messages over two hours, four minutes apart; #7 is Critical
    let now = Utc::now();
    let mut stored = Vec::new();
    for i in 0..30i64 {
        let mut message = Message::user(format!("message {i:02} {}", "lorem ipsum ".repeat(8)))
            .at(now - TimeDelta::minutes(120 - 4 * i));
        if i == 7 {
            message = message.with_importance(Importance::Critical);
        }
        stored.push(manager.add_message(message));
    }
    let critical = stored[7].clone();
    let first_twenty: Vec<&Message> = stored[..20].iter().collect();
    let span = TimeSpan::covering(first_twenty.iter().copied()).unwrap();
    let summary = manager
        .add_summary(Summary::new(
            "Setup and planning.",
            first_twenty.iter().map(|m| m.id.clone()).collect(),
            span,
        ))
        .unwrap();

    let per_message = stored[29].token_count;
    let budget = summary.token_count + 4 * per_message;
    let selection = selector.select(budget, now).unwrap();

    assert_eq!(selection.summaries.len(), 1);
    assert_eq!(selection.summaries[0].id, summary.id);
    assert!(selection.messages.iter().any(|m| m.id == critical.id));
    assert_eq!(selection.messages.last().unwrap().id, stored[29].id);

    // Only the Critical message may push the total over budget
    assert!(selection.total_tokens - critical.token_count <= budget);

    // Non-critical picks are the newest uncovered messages, in order
    let picked: Vec<usize> = selection
        .messages
        .iter()
        .filter(|m| !m.is_critical())
        .map(|m| stored.iter().position(|s| s.id == m.id).unwrap())
        .collect();
    assert!(!picked.is_empty());
    assert!(picked.iter().all(|&i| i >= 20));
    assert_eq!(picked.last(), Some(&29));
    assert!(picked.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(
        selection
            .messages
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at)
    );
}

fn background_config() -> AppConfig {
    let mut config = offline_config();
    config.summarizer.async_mode = true;
    config.summarizer.poll_interval_ms = 10;
    config.context.hierarchical.auto_summarize_threshold = 3;
    config
}

#[tokio::test(start_paused = true)]
async fn background_summary_reaches_the_next_request() {
    let primary = Arc::new(MockBackend::new());
    let summarizer = Arc::new(
        MockBackend::new()
            .with_model("summary-model")
            .with_reply("The user opened with a question about pricing."),
    );
    let orch = Orchestrator::builder(background_config())
        .with_backend(primary.clone())
        .with_summarizer_backend(summarizer.clone())
        .build()
        .await
        .unwrap();

    orch.send_user_message("first question").await.unwrap();
    orch.send_user_message("second question").await.unwrap();
    assert_eq!(orch.context_statistics()["pending_summaries"], json!(1));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(summarizer.call_count(), 1);
    assert_eq!(orch.context_statistics()["summary_count"], json!(1));

    orch.send_user_message("third question").await.unwrap();
    let request = &primary.requests()[2];
    let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.iter().any(|c| c.starts_with(SUMMARIES_LABEL)));
    assert!(!contents.contains(&"first question"));
    assert_eq!(*contents.last().unwrap(), "third question");
    orch.close().await.unwrap();
}

/// Never answers.
struct StuckBackend;

#[async_trait]
impl Backend for StuckBackend {
    fn name(&self) -> &str {
        "stuck"
    }

    fn model_id(&self) -> &str {
        "stuck-model"
    }

    async fn send(&self, _request: BackendRequest) -> Result<BackendResponse, BackendError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn close_does_not_wait_for_a_stuck_summary() {
    let mut config = background_config();
    config.backend.timeout_secs = 3600;
    let orch = Orchestrator::builder(config)
        .with_backend(Arc::new(MockBackend::new()))
        .with_summarizer_backend(Arc::new(StuckBackend))
        .build()
        .await
        .unwrap();

    orch.send_user_message("first question").await.unwrap();
    orch.send_user_message("second question").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let closed = tokio::time::timeout(Duration::from_secs(60), orch.close()).await;
    assert!(matches!(closed, Ok(Ok(()))));
}

#[tokio::test(start_paused = true)]
async fn clear_discards_summary_of_old_conversation() {
    let summarizer = Arc::new(
        MockBackend::new()
            .with_model("summary-model")
            .with_reply("Summary of the conversation that was cleared.")
            .with_delay(Duration::from_secs(5)),
    );
    let orch = Orchestrator::builder(background_config())
        .with_backend(Arc::new(MockBackend::new()))
        .with_summarizer_backend(summarizer.clone())
        .build()
        .await
        .unwrap();

    orch.send_user_message("first question").await.unwrap();
    orch.send_user_message("second question").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(summarizer.call_count(), 1);

    orch.clear().await;
    assert_eq!(orch.context_statistics()["pending_summaries"], json!(0));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(orch.history().is_empty());
    assert_eq!(orch.context_statistics()["summary_count"], json!(0));
    orch.close().await.unwrap();
}
