//! The conversation orchestrator: one user turn at a time.
//!
//! A turn:
//!
//! 1. **Record** the user message (prioritized) in the context manager
//! 2. **Schedule** a summary if the auto-summarize trigger fires
//! 3. **Recall**: when the user refers to earlier sessions and one was
//!    loaded, add a Critical instruction to history
//! 4. **Loop**: select context → call the backend → dispatch a requested
//!    tool and go again, or commit the final reply
//!
//! The loop ends on a textual reply, a tool error, or the per-turn
//! iteration ceiling. A backend error ends the turn without committing
//! anything for that call.

use crate::chat::ChatService;
use crate::context::hierarchical::HierarchicalSelector;
use crate::context::manager::ContextManager;
use crate::context::prioritizer::Prioritizer;
use crate::context::queue::SummaryService;
use crate::context::summarizer::Summarizer;
use crate::context::token::{HeuristicCounter, TokenCounter};
use crate::dispatcher::ToolDispatcher;
use async_trait::async_trait;
use chrono::Utc;
use parley_config::{AppConfig, SamplingConfig};
use parley_core::backend::{Backend, BackendRequest, BackendResponse};
use parley_core::error::{BackendError, Error};
use parley_core::message::{ContextSelection, Importance, Message};
use parley_core::tool::{ToolCall, ToolRegistry, ToolResult};
use parley_providers::build_backend;
use parley_store::{FileSessionStore, SessionData, SessionStore, session_id_for};
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, an assistant working in the user's terminal. \
When tools are available you may read files, list directories, search file contents, write files, \
and run shell commands. Call one tool at a time and wait for its result before answering. \
Keep answers concise and say so plainly when you are unsure.";

/// Reply and history notice when a turn runs out of tool iterations.
pub const TOOL_CEILING_MESSAGE: &str = "Exceeded maximum number of tool calls";

/// Added to history when the user refers back to a loaded session.
pub const RECALL_INSTRUCTION: &str = "The user is referring to earlier conversation. \
Messages and summaries from previous sessions are part of this context; consult them before answering \
and say so if the detail they ask about is not there.";

pub const TOOL_USE_TAG: &str = "tool_use";
pub const TOOL_RESULT_TAG: &str = "tool_result";
pub const TOOL_ERROR_TAG: &str = "tool_error";
pub const CONTEXT_RECALL_TAG: &str = "context_recall";
pub const SESSION_NOTICE_TAG: &str = "session_notice";

/// Runtime switches for one session. Snapshotted at the start of a turn.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub tools_enabled: bool,
    pub context_enabled: bool,
    pub hierarchical: bool,
    pub max_iterations: usize,
    pub backend_timeout: Duration,
    pub sampling: SamplingConfig,
    pub max_context_tokens: usize,
    pub recall_phrases: Vec<String>,
    pub session_name: Option<String>,
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tools_enabled: config.tools.enabled,
            context_enabled: config.context.enabled,
            hierarchical: config.context.hierarchical.enabled,
            max_iterations: config.tools.max_iterations,
            backend_timeout: Duration::from_secs(config.backend.timeout_secs),
            sampling: config.sampling,
            max_context_tokens: config.context.max_context_tokens,
            recall_phrases: config
                .context
                .recall_phrases
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            session_name: config.persistence.session_name.clone(),
        }
    }
}

/// Assembles an [`Orchestrator`] from configuration, with optional
/// injected collaborators.
pub struct OrchestratorBuilder {
    config: AppConfig,
    backend: Option<Arc<dyn Backend>>,
    summarizer_backend: Option<Arc<dyn Backend>>,
    store: Option<Arc<dyn SessionStore>>,
    registry: Option<Arc<ToolRegistry>>,
    counter: Option<Arc<dyn TokenCounter>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            backend: None,
            summarizer_backend: None,
            store: None,
            registry: None,
            counter: None,
        }
    }

    /// Use this backend instead of building one from `config.backend`.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a distinct summarizer backend. Without one the summarizer is
    /// built from `config.summarizer.backend`, or aliases the primary.
    pub fn with_summarizer_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.summarizer_backend = Some(backend);
        self
    }

    /// Use this store instead of the file store from `config.persistence`.
    /// Ignored when persistence is disabled.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Validate configuration, wire every component, and resume the most
    /// recent session when configured to.
    pub async fn build(self) -> Result<Orchestrator, Error> {
        let config = self.config;
        config.validate().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;

        let primary = match self.backend {
            Some(backend) => backend,
            None => build_backend(&config.backend)?,
        };
        let summarizer_backend = match (self.summarizer_backend, &config.summarizer.backend) {
            (Some(backend), _) => backend,
            (None, Some(cfg)) => build_backend(cfg)?,
            (None, None) => Arc::clone(&primary),
        };
        let summarizer_aliased = Arc::ptr_eq(&primary, &summarizer_backend);

        let counter = self.counter.unwrap_or_else(|| Arc::new(HeuristicCounter));
        let prioritizer = Arc::new(Prioritizer::from_config(&config.context).map_err(|e| {
            Error::Config {
                message: format!("invalid context pattern: {e}"),
            }
        })?);

        let manager = Arc::new(ContextManager::new(Arc::clone(&counter), &config.context));
        manager.set_system_prompt(
            config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        );
        let selector =
            HierarchicalSelector::new(Arc::clone(&manager), config.context.hierarchical.clone());

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(parley_tools::default_registry(&config.tools)?),
        };

        let summary_timeout = config
            .summarizer
            .backend
            .as_ref()
            .map_or(config.backend.timeout_secs, |b| b.timeout_secs);
        let turn_gate = Arc::new(tokio::sync::Mutex::new(()));
        let summaries = SummaryService::new(
            Summarizer::new(
                Arc::clone(&summarizer_backend),
                config.summarizer.clone(),
                Arc::clone(&prioritizer),
                Arc::clone(&counter),
            )
            .with_timeout(Duration::from_secs(summary_timeout)),
            Arc::clone(&manager),
            config.summarizer.max_queue_depth,
            config.summarizer.async_mode,
            Duration::from_millis(config.summarizer.poll_interval_ms),
        )
        .with_turn_gate(Arc::clone(&turn_gate));
        summaries.start();

        let store: Option<Arc<dyn SessionStore>> = if !config.persistence.enabled {
            None
        } else if let Some(store) = self.store {
            Some(store)
        } else {
            let store = FileSessionStore::from_config(&config.persistence);
            store.ensure_dir().await?;
            Some(Arc::new(store))
        };

        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator {
            primary,
            summarizer_backend,
            summarizer_aliased,
            manager,
            selector,
            prioritizer,
            dispatcher: ToolDispatcher::new(registry),
            summaries,
            store,
            options: RwLock::new(SessionOptions::from_config(&config)),
            turn_gate,
            loaded_session_id: Mutex::new(None),
            turn_cancel: Mutex::new(shutdown.child_token()),
            shutdown,
            closed: AtomicBool::new(false),
        };

        info!(
            backend = orchestrator.primary.name(),
            model = orchestrator.primary.model_id(),
            summarizer = orchestrator.summarizer_backend.model_id(),
            persistence = orchestrator.store.is_some(),
            "Orchestrator ready"
        );

        if config.persistence.resume {
            orchestrator.resume().await;
        }
        Ok(orchestrator)
    }
}

/// Drives the user → backend → tool → backend → … → reply loop for one
/// conversation.
pub struct Orchestrator {
    primary: Arc<dyn Backend>,
    summarizer_backend: Arc<dyn Backend>,
    summarizer_aliased: bool,
    manager: Arc<ContextManager>,
    selector: HierarchicalSelector,
    prioritizer: Arc<Prioritizer>,
    dispatcher: ToolDispatcher,
    summaries: SummaryService,
    store: Option<Arc<dyn SessionStore>>,
    options: RwLock<SessionOptions>,
    /// One turn (or configuration change) at a time
    turn_gate: Arc<tokio::sync::Mutex<()>>,
    loaded_session_id: Mutex<Option<String>>,
    turn_cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    fn options(&self) -> SessionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_options(&self, f: impl FnOnce(&mut SessionOptions)) {
        f(&mut self.options.write().unwrap_or_else(PoisonError::into_inner));
    }

    // ── Session lifecycle ─────────────────────────────────────────────────

    /// Load the most recently updated session, if any.
    async fn resume(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.latest().await {
            Ok(Some(data)) => {
                let session_id = data.session_id().to_string();
                let count = data.messages.len();
                info!(
                    session_id = %session_id,
                    messages = count,
                    summaries = data.summaries.len(),
                    "Resumed previous session"
                );
                self.manager.restore(data.messages, data.summaries);
                self.manager.add_message(
                    Message::system(format!(
                        "Loaded {count} messages from previous session {session_id}. \
                         Context from that conversation is available."
                    ))
                    .with_importance(Importance::Critical)
                    .with_tag(SESSION_NOTICE_TAG),
                );
                *self
                    .loaded_session_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(session_id);
            }
            Ok(None) => debug!("No previous session to resume"),
            Err(e) => {
                warn!(error = %e, "Could not load previous session, starting fresh");
                self.manager.add_message(
                    Message::system(format!(
                        "The previous session could not be loaded ({e}); starting with an empty history."
                    ))
                    .with_tag(SESSION_NOTICE_TAG),
                );
            }
        }
    }

    /// The stable ID this conversation saves under. A resumed session keeps
    /// its original ID; otherwise it derives from the earliest message and
    /// the primary model.
    pub fn session_id(&self) -> Option<String> {
        let loaded = self
            .loaded_session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        loaded.or_else(|| {
            self.manager
                .earliest_message_time()
                .map(|earliest| session_id_for(earliest, self.primary.model_id()))
        })
    }

    async fn save(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let messages = self.manager.full_history();
        if messages.is_empty() {
            return;
        }
        let Some(session_id) = self.session_id() else {
            return;
        };
        let data = SessionData::new(
            session_id,
            self.options().session_name,
            self.primary.model_id(),
            messages,
            self.manager.summaries(),
        );
        if let Err(e) = store.save(&data).await {
            warn!(session_id = %data.session_id(), error = %e, "Failed to save session");
        }
    }

    /// Save the session, stop the summary worker, and close the backends.
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let _turn = self.turn_gate.lock().await;
            self.save().await;
        }
        // The worker may be waiting on the turn gate, so it stops after the
        // gate is released
        self.shutdown.cancel();
        self.summaries.shutdown().await;

        let mut first_error = None;
        if let Err(e) = self.primary.close().await {
            warn!(backend = self.primary.name(), error = %e, "Failed to close backend");
            first_error = Some(e);
        }
        if !self.summarizer_aliased {
            if let Err(e) = self.summarizer_backend.close().await {
                warn!(backend = self.summarizer_backend.name(), error = %e, "Failed to close summarizer backend");
                first_error.get_or_insert(e);
            }
        }

        info!(session_id = ?self.session_id(), "Session closed");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Abort the backend call of the turn in flight, if any.
    pub fn cancel_turn(&self) {
        self.turn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn begin_turn(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        *self
            .turn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    // ── The turn ──────────────────────────────────────────────────────────

    /// Run one user turn and return the reply.
    ///
    /// Tool failures and the iteration ceiling end the turn with a notice
    /// that is also recorded in history. Backend failures return an error
    /// and leave no trace of the failed call in history.
    pub async fn send_user_message(&self, text: &str) -> Result<String, Error> {
        let _turn = self.turn_gate.lock().await;
        if self.is_closed() {
            return Err(Error::Internal("session is closed".into()));
        }
        let opts = self.options();
        let cancel = self.begin_turn();

        self.commit(Message::user(text), &opts);

        if opts.context_enabled && opts.hierarchical {
            self.schedule_summary().await;
        }

        if self.wants_recall(&opts, text) {
            debug!("User referred to earlier sessions, adding recall instruction");
            self.commit(
                Message::system(RECALL_INSTRUCTION)
                    .with_importance(Importance::Critical)
                    .with_tag(CONTEXT_RECALL_TAG),
                &opts,
            );
        }

        let mut tool_results: Vec<ToolResult> = Vec::new();
        for iteration in 0..opts.max_iterations {
            let response = self
                .request_reply(&opts, &tool_results, &cancel, iteration)
                .await
                .inspect_err(|e| warn!(iteration, error = %e, "Backend call failed"))?;

            let wants_tool = response.wants_tool();
            let call = match response.tool_request {
                Some(call) if wants_tool => call,
                _ => {
                    debug!(iteration, "Final reply received");
                    self.commit(Message::assistant(response.content.clone()), &opts);
                    return Ok(response.content);
                }
            };

            match self.dispatcher.dispatch(&call).await {
                Ok(result) => {
                    self.record_tool_use(&call, &result, &opts);
                    tool_results.push(result);
                }
                Err(e) => {
                    let notice = format!("Tool error ({}): {e}", call.name);
                    self.commit(
                        Message::system(notice.clone())
                            .with_tag(TOOL_ERROR_TAG)
                            .with_tag(format!("tool:{}", call.name)),
                        &opts,
                    );
                    return Ok(notice);
                }
            }
        }

        warn!(max_iterations = opts.max_iterations, "Tool call ceiling reached");
        self.commit(
            Message::system(TOOL_CEILING_MESSAGE).with_tag(TOOL_ERROR_TAG),
            &opts,
        );
        Ok(TOOL_CEILING_MESSAGE.to_string())
    }

    /// Prioritize (when context management is on) and append.
    fn commit(&self, mut message: Message, opts: &SessionOptions) -> Message {
        if opts.context_enabled {
            self.prioritizer.enhance(&mut message);
        }
        self.manager.add_message(message)
    }

    fn record_tool_use(&self, call: &ToolCall, result: &ToolResult, opts: &SessionOptions) {
        let tool_tag = format!("tool:{}", call.name);
        debug!(tool = %call.name, bytes = result.content.len(), "Tool call succeeded");
        self.commit(
            Message::assistant(format!(
                "Using tool: {} with input: {}",
                call.name, result.input
            ))
            .with_tag(TOOL_USE_TAG)
            .with_tag(tool_tag.clone()),
            opts,
        );
        self.commit(
            Message::system(format!(
                "Tool result from {}: {}",
                call.name, result.content
            ))
            .with_tag(TOOL_RESULT_TAG)
            .with_tag(tool_tag),
            opts,
        );
    }

    async fn schedule_summary(&self) {
        let pending = self.summaries.pending_message_ids();
        let Some(ids) = self.selector.check_auto_summarize(Utc::now(), &pending) else {
            return;
        };
        if let Err(e) = self.summaries.submit(ids, 1).await {
            warn!(error = %e, "Could not schedule summarization");
        }
    }

    fn wants_recall(&self, opts: &SessionOptions, text: &str) -> bool {
        if self.store.is_none() || !self.manager.has_loaded_history() {
            return false;
        }
        let lower = text.to_lowercase();
        opts.recall_phrases
            .iter()
            .any(|phrase| lower.contains(phrase.as_str()))
    }

    /// Select context, build the request, and call the backend. A
    /// context-length rejection is retried once at half the budget.
    async fn request_reply(
        &self,
        opts: &SessionOptions,
        tool_results: &[ToolResult],
        cancel: &CancellationToken,
        iteration: usize,
    ) -> Result<BackendResponse, BackendError> {
        let mut budget = opts.max_context_tokens;
        let mut shrunk = false;
        loop {
            let selection = self.select(opts, budget, shrunk);
            debug!(
                iteration,
                messages = selection.messages.len(),
                summaries = selection.summaries.len(),
                tokens = selection.total_tokens,
                budget,
                "Context selected"
            );

            let mut request = BackendRequest::new(
                self.manager.prepare_backend_messages(&selection),
                opts.sampling.max_tokens,
            );
            request.temperature = opts.sampling.temperature;
            request.top_p = opts.sampling.top_p;
            if opts.tools_enabled {
                request.options.tools = self.dispatcher.registry().enabled_tools();
            }
            request.options.tool_results = tool_results.to_vec();

            match self.send_with_deadline(request, opts.backend_timeout, cancel).await {
                Err(BackendError::ContextLengthExceeded(reason)) if !shrunk && budget > 1 => {
                    warn!(budget, reason = %reason, "Context too long, retrying with half the budget");
                    budget /= 2;
                    shrunk = true;
                }
                other => return other,
            }
        }
    }

    fn select(&self, opts: &SessionOptions, budget: usize, shrunk: bool) -> ContextSelection {
        if !opts.context_enabled && !shrunk {
            return self.manager.unbounded_selection();
        }
        if opts.context_enabled && opts.hierarchical {
            match self.selector.select(budget, Utc::now()) {
                Ok(selection) => return selection,
                Err(e) => warn!(error = %e, "Hierarchical selection failed, using flat selection"),
            }
        }
        self.manager.get_context_for_prompt(budget)
    }

    async fn send_with_deadline(
        &self,
        request: BackendRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, BackendError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            result = tokio::time::timeout(timeout, self.primary.send(request)) => {
                result.unwrap_or(Err(BackendError::Timeout {
                    timeout_secs: timeout.as_secs(),
                }))
            }
        }
    }

    // ── UI surface ────────────────────────────────────────────────────────

    pub fn history(&self) -> Vec<Message> {
        self.manager.full_history()
    }

    /// Case-insensitive search over history, newest first.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<Message> {
        self.manager.search(query, max_results)
    }

    /// Forget the conversation. The next save starts a new session.
    /// Pending summaries of the old conversation are dropped.
    pub async fn clear(&self) {
        let _turn = self.turn_gate.lock().await;
        self.summaries.clear();
        self.manager.clear();
        *self
            .loaded_session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!("Conversation cleared");
    }

    pub async fn update_system_prompt(&self, text: &str) {
        let _turn = self.turn_gate.lock().await;
        self.manager.set_system_prompt(text);
    }

    pub async fn enable_tools(&self, enabled: bool) {
        let _turn = self.turn_gate.lock().await;
        self.update_options(|o| o.tools_enabled = enabled);
    }

    pub async fn enable_context_management(&self, enabled: bool) {
        let _turn = self.turn_gate.lock().await;
        self.update_options(|o| o.context_enabled = enabled);
    }

    pub fn context_statistics(&self) -> Map<String, Value> {
        let stats = self.manager.stats();
        let opts = self.options();
        let enabled_tools: Vec<String> = self
            .dispatcher
            .registry()
            .enabled_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();

        let mut map = Map::new();
        map.insert("session_id".into(), json!(self.session_id()));
        map.insert("backend".into(), json!(self.primary.name()));
        map.insert("model".into(), json!(self.primary.model_id()));
        map.insert(
            "summarizer_model".into(),
            json!(self.summarizer_backend.model_id()),
        );
        map.insert("message_count".into(), json!(stats.message_count));
        map.insert("summary_count".into(), json!(stats.summary_count));
        map.insert("critical_count".into(), json!(stats.critical_count));
        map.insert("message_tokens".into(), json!(stats.message_tokens));
        map.insert("summary_tokens".into(), json!(stats.summary_tokens));
        map.insert("system_prompt_tokens".into(), json!(stats.system_tokens));
        map.insert("max_context_tokens".into(), json!(opts.max_context_tokens));
        map.insert("context_management".into(), json!(opts.context_enabled));
        map.insert("hierarchical".into(), json!(opts.hierarchical));
        map.insert("tools_enabled".into(), json!(opts.tools_enabled));
        map.insert("enabled_tools".into(), json!(enabled_tools));
        map.insert("max_iterations".into(), json!(opts.max_iterations));
        map.insert(
            "pending_summaries".into(),
            json!(self.summaries.queue_len()),
        );
        map.insert(
            "loaded_history".into(),
            json!(self.manager.has_loaded_history()),
        );
        map.insert("persistence".into(), json!(self.store.is_some()));
        map
    }
}

#[async_trait]
impl ChatService for Orchestrator {
    async fn send_user_message(&self, text: &str) -> Result<String, Error> {
        Orchestrator::send_user_message(self, text).await
    }

    fn history(&self) -> Vec<Message> {
        Orchestrator::history(self)
    }

    async fn clear(&self) {
        Orchestrator::clear(self).await
    }

    async fn update_system_prompt(&self, text: &str) {
        Orchestrator::update_system_prompt(self, text).await
    }

    async fn enable_tools(&self, enabled: bool) {
        Orchestrator::enable_tools(self, enabled).await
    }

    async fn enable_context_management(&self, enabled: bool) {
        Orchestrator::enable_context_management(self, enabled).await
    }

    fn context_statistics(&self) -> Map<String, Value> {
        Orchestrator::context_statistics(self)
    }

    async fn close(&self) -> Result<(), Error> {
        Orchestrator::close(self).await
    }
}
