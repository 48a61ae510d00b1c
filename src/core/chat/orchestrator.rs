// The chat orchestrator drives one conversational turn:
//
//   AwaitingModelResponse -> (DirectReply | ToolCallRequested)
//     -> [ToolCallRequested: AwaitingToolResult -> AwaitingModelResponse]*
//     -> Done
//
// The loop is bounded by a hard round ceiling, results append in request
// order regardless of completion order, turns for one chat id never overlap,
// and the whole turn is scoped to one explicitly passed session - nothing
// here reads ambient credential state.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::core::auth::{AuthError, Identity, SessionValidator};
use crate::core::tools::{ToolCallRequest, ToolCallResult, ToolDescriptor, ToolInvoker};

use super::engine::{ConversationEngine, EngineError, EngineReply};
use super::history::{ChatHistoryService, ChatHistoryStore};
use super::models::{ChatError, ChatRole, TranscriptEntry};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    History(#[from] ChatError),

    #[error("Turn was cancelled by the caller")]
    Cancelled,
}

/// Caller side of turn cancellation.
pub struct TurnCancelHandle {
    tx: watch::Sender<bool>,
}

impl TurnCancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Orchestrator side of turn cancellation. `never()` is the common case for
/// callers that just await the turn.
pub struct TurnCancel {
    rx: Option<watch::Receiver<bool>>,
}

impl TurnCancel {
    pub fn pair() -> (TurnCancelHandle, TurnCancel) {
        let (tx, rx) = watch::channel(false);
        (TurnCancelHandle { tx }, TurnCancel { rx: Some(rx) })
    }

    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Resolves once the caller cancels; pends forever otherwise.
    async fn cancelled(&mut self) {
        match &mut self.rx {
            None => std::future::pending().await,
            Some(rx) => loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling: this turn can no
                    // longer be cancelled.
                    std::future::pending::<()>().await;
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard ceiling on engine/tool round-trips per turn.
    pub max_tool_rounds: usize,
    /// How many stored messages seed the transcript of a new turn.
    pub history_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            history_window: 10,
        }
    }
}

/// What a completed turn hands back to the HTTP layer.
#[derive(Debug)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    /// Id of the persisted assistant message.
    pub message_id: Uuid,
    pub reply: String,
    pub tool_round_trips: usize,
    /// This turn's transcript, user message through final reply, tool
    /// entries included.
    pub transcript: Vec<TranscriptEntry>,
}

const TURN_LIMIT_REPLY: &str = "I reached the limit of tool calls I can make for a single request. \
     Here is where things stand so far - ask again and I will pick up from here.";

pub struct ChatOrchestrator<V, E, R, H> {
    sessions: Arc<V>,
    engine: Arc<E>,
    tools: Arc<R>,
    history: Arc<ChatHistoryService<H>>,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    config: OrchestratorConfig,
}

impl<V, E, R, H> ChatOrchestrator<V, E, R, H>
where
    V: SessionValidator,
    E: ConversationEngine,
    R: ToolInvoker + 'static,
    H: ChatHistoryStore,
{
    pub fn new(
        sessions: Arc<V>,
        engine: Arc<E>,
        tools: Arc<R>,
        history: Arc<ChatHistoryService<H>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            engine,
            tools,
            history,
            turn_locks: DashMap::new(),
            config,
        }
    }

    /// Runs one full turn: user message in, final natural-language reply out.
    pub async fn run_turn(
        &self,
        access_token: &str,
        chat_id: &str,
        message: &str,
        context: Map<String, Value>,
        mut cancel: TurnCancel,
    ) -> Result<TurnOutcome, TurnError> {
        let identity = self.sessions.validate(access_token).await?;

        // One turn at a time per chat id, in arrival order (tokio mutexes are
        // FIFO). Turns for different chats proceed independently.
        let lock = self.turn_lock(chat_id);
        let _turn_guard = lock.lock().await;

        let turn_id = Uuid::new_v4();
        tracing::info!(%turn_id, %chat_id, subject = %identity.subject, "turn started");

        self.history
            .record_message(&identity.subject, chat_id, ChatRole::User, message)
            .await?;

        // Seed the transcript with the recent window of stored messages; the
        // just-appended user message is the last of them.
        let detail = self.history.session_detail(&identity.subject, chat_id).await?;
        let mut transcript: Vec<TranscriptEntry> = detail
            .messages
            .iter()
            .rev()
            .take(self.config.history_window.max(1))
            .rev()
            .map(|m| TranscriptEntry {
                role: m.role,
                content: m.content.clone(),
                correlation_id: None,
                timestamp: m.timestamp,
            })
            .collect();
        let turn_start = transcript.len().saturating_sub(1);

        let system_prompt = self.system_prompt(&identity, &context);
        let mut rounds = 0usize;

        loop {
            let tools = self.tools.available_tools();
            let reply = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(%turn_id, "turn cancelled while awaiting model response");
                    return Err(TurnError::Cancelled);
                }
                reply = self.engine.respond(&system_prompt, &transcript, &tools) => reply?,
            };

            match reply {
                EngineReply::Direct(text) => {
                    let stored = self
                        .history
                        .record_message(&identity.subject, chat_id, ChatRole::Assistant, &text)
                        .await?;
                    transcript.push(TranscriptEntry::assistant(&text));
                    tracing::info!(%turn_id, rounds, "turn completed");
                    return Ok(TurnOutcome {
                        turn_id,
                        message_id: stored.id,
                        reply: text,
                        tool_round_trips: rounds,
                        transcript: transcript.split_off(turn_start),
                    });
                }
                EngineReply::ToolCalls(intents) => {
                    if rounds >= self.config.max_tool_rounds {
                        // Fatal to the loop, not to the turn: answer with what
                        // we have instead of spinning forever.
                        tracing::warn!(%turn_id, rounds, "tool round ceiling reached");
                        let stored = self
                            .history
                            .record_message(
                                &identity.subject,
                                chat_id,
                                ChatRole::Assistant,
                                TURN_LIMIT_REPLY,
                            )
                            .await?;
                        transcript.push(TranscriptEntry::assistant(TURN_LIMIT_REPLY));
                        return Ok(TurnOutcome {
                            turn_id,
                            message_id: stored.id,
                            reply: TURN_LIMIT_REPLY.to_string(),
                            tool_round_trips: rounds,
                            transcript: transcript.split_off(turn_start),
                        });
                    }
                    rounds += 1;

                    // The session may have expired while earlier rounds ran;
                    // better to abort than to keep acting on stale credentials.
                    self.sessions.validate(access_token).await?;

                    let requests: Vec<ToolCallRequest> = intents
                        .into_iter()
                        .enumerate()
                        .map(|(i, intent)| {
                            ToolCallRequest::new(turn_id, i, intent.name, intent.arguments)
                        })
                        .collect();

                    // The assistant entry anchoring the tool entries that follow.
                    transcript.push(TranscriptEntry::assistant(request_announcement(&requests)));

                    let results = self
                        .dispatch_round(&identity, requests, &tools, &mut cancel)
                        .await?;
                    for result in results {
                        transcript.push(TranscriptEntry::tool(
                            result.correlation_id,
                            result.transcript_payload().to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Dispatches one round of tool calls and returns the results in request
    /// order.
    ///
    /// Sequential is the default. The round runs concurrently only when every
    /// requested tool is marked parallel-safe in the registry; completions
    /// are then buffered and re-ordered by request sequence before they reach
    /// the transcript.
    async fn dispatch_round(
        &self,
        identity: &Identity,
        requests: Vec<ToolCallRequest>,
        tools: &[ToolDescriptor],
        cancel: &mut TurnCancel,
    ) -> Result<Vec<ToolCallResult>, TurnError> {
        let concurrent = requests.len() > 1
            && requests.iter().all(|r| {
                tools
                    .iter()
                    .find(|d| d.name == r.name)
                    .map(|d| d.parallel_safe)
                    .unwrap_or(false)
            });

        let mut results = Vec::with_capacity(requests.len());

        if concurrent {
            let mut set = tokio::task::JoinSet::new();
            for request in requests {
                let invoker = Arc::clone(&self.tools);
                let identity = identity.clone();
                set.spawn(async move { invoker.invoke(&identity, &request).await });
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Dropping the set aborts in-flight dispatches.
                        return Err(TurnError::Cancelled);
                    }
                    joined = set.join_next() => match joined {
                        Some(Ok(result)) => results.push(result),
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "tool dispatch task failed");
                        }
                        None => break,
                    },
                }
            }
            results.sort_by_key(|r| r.sequence);
        } else {
            for request in &requests {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                    result = self.tools.invoke(identity, request) => result,
                };
                results.push(result);
            }
        }

        Ok(results)
    }

    fn turn_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn system_prompt(&self, identity: &Identity, context: &Map<String, Value>) -> String {
        let mut prompt = format!(
            "You are a helpful AI assistant that manages the user's Google Workspace \
             (Calendar, Gmail, Tasks) through the available tools.\n\n\
             User information:\n- Name: {}\n- Email: {}\n\n\
             Use the tools when the user asks for calendar, email or task actions. \
             Explain what you are doing, and if a tool call fails, acknowledge the \
             limitation instead of inventing a result.",
            identity.name, identity.email
        );
        if !context.is_empty() {
            prompt.push_str("\n\nAdditional context from the client:\n");
            prompt.push_str(&Value::Object(context.clone()).to_string());
        }
        prompt
    }
}

fn request_announcement(requests: &[ToolCallRequest]) -> String {
    json!({
        "tool_calls": requests
            .iter()
            .map(|r| json!({
                "correlation_id": r.correlation_id,
                "name": r.name,
                "arguments": r.arguments,
            }))
            .collect::<Vec<_>>()
    })
    .to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat::engine::ToolCallIntent;
    use crate::core::chat::models::{ChatSessionDetail, ChatSessionSummary, StoredMessage};
    use crate::core::tools::ToolFailure;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, Duration};

    // ---- scripted session validator -------------------------------------

    struct ScriptedValidator {
        /// Calls after this many succeed fail with SessionExpired.
        valid_calls: usize,
        calls: AtomicUsize,
        identity: Identity,
    }

    impl ScriptedValidator {
        fn always() -> Self {
            Self::until(usize::MAX)
        }

        fn until(valid_calls: usize) -> Self {
            Self {
                valid_calls,
                calls: AtomicUsize::new(0),
                identity: Identity::from_claims(
                    &crate::core::auth::GoogleClaims {
                        subject: "u1".into(),
                        email: "a@b.com".into(),
                        name: "Ada".into(),
                        picture: None,
                    },
                    Utc::now(),
                ),
            }
        }
    }

    #[async_trait]
    impl SessionValidator for ScriptedValidator {
        async fn validate(&self, _access_token: &str) -> Result<Identity, AuthError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.valid_calls {
                Ok(self.identity.clone())
            } else {
                Err(AuthError::SessionExpired)
            }
        }
    }

    // ---- scripted engine --------------------------------------------------

    struct ScriptedEngine {
        replies: StdMutex<VecDeque<EngineReply>>,
        seen_transcripts: StdMutex<Vec<Vec<TranscriptEntry>>>,
    }

    impl ScriptedEngine {
        fn new(replies: Vec<EngineReply>) -> Self {
            Self {
                replies: StdMutex::new(replies.into()),
                seen_transcripts: StdMutex::new(Vec::new()),
            }
        }

        fn tool_call(name: &str, args: Value) -> EngineReply {
            let arguments = match args {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            EngineReply::ToolCalls(vec![ToolCallIntent {
                name: name.to_string(),
                arguments,
            }])
        }
    }

    #[async_trait]
    impl ConversationEngine for ScriptedEngine {
        async fn respond(
            &self,
            _system_prompt: &str,
            transcript: &[TranscriptEntry],
            _tools: &[ToolDescriptor],
        ) -> Result<EngineReply, EngineError> {
            self.seen_transcripts
                .lock()
                .unwrap()
                .push(transcript.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineError::Provider("script exhausted".into()))
        }
    }

    // ---- scripted tool invoker -------------------------------------------

    enum ToolScript {
        Ok { payload: Value, delay_ms: u64 },
        TimedOut,
        Hang,
    }

    struct ScriptedInvoker {
        tools: Vec<(ToolDescriptor, ToolScript)>,
    }

    impl ScriptedInvoker {
        fn descriptor(name: &str, parallel_safe: bool) -> ToolDescriptor {
            ToolDescriptor {
                name: name.to_string(),
                description: String::new(),
                input_schema: Value::Null,
                parallel_safe,
            }
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        fn available_tools(&self) -> Arc<Vec<ToolDescriptor>> {
            Arc::new(self.tools.iter().map(|(d, _)| d.clone()).collect())
        }

        async fn invoke(&self, _identity: &Identity, request: &ToolCallRequest) -> ToolCallResult {
            match self.tools.iter().find(|(d, _)| d.name == request.name) {
                Some((_, ToolScript::Ok { payload, delay_ms })) => {
                    if *delay_ms > 0 {
                        sleep(Duration::from_millis(*delay_ms)).await;
                    }
                    ToolCallResult::succeeded(request, payload.clone(), false, *delay_ms)
                }
                Some((_, ToolScript::TimedOut)) => {
                    ToolCallResult::failed(request, ToolFailure::Timeout { seconds: 30 }, 30_000)
                }
                Some((_, ToolScript::Hang)) => {
                    std::future::pending().await
                }
                None => ToolCallResult::failed(
                    request,
                    ToolFailure::UnknownTool(request.name.clone()),
                    0,
                ),
            }
        }
    }

    // ---- in-memory chat store for tests ----------------------------------

    #[derive(Default)]
    struct MapChatStore {
        sessions: DashMap<(String, String), ChatSessionDetail>,
    }

    #[async_trait]
    impl ChatHistoryStore for MapChatStore {
        async fn create(
            &self,
            subject: &str,
            id: Option<String>,
            title: &str,
        ) -> Result<ChatSessionDetail, ChatError> {
            let now = Utc::now();
            let detail = ChatSessionDetail {
                id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                title: title.to_string(),
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
                is_active: true,
            };
            self.sessions.insert(
                (subject.to_string(), detail.id.clone()),
                detail.clone(),
            );
            Ok(detail)
        }

        async fn list(
            &self,
            subject: &str,
            _limit: usize,
        ) -> Result<Vec<ChatSessionSummary>, ChatError> {
            Ok(self
                .sessions
                .iter()
                .filter(|e| e.key().0 == subject && e.value().is_active)
                .map(|e| ChatSessionSummary {
                    id: e.value().id.clone(),
                    title: e.value().title.clone(),
                    created_at: e.value().created_at,
                    updated_at: e.value().updated_at,
                    message_count: e.value().messages.len(),
                    is_active: true,
                })
                .collect())
        }

        async fn get(
            &self,
            subject: &str,
            id: &str,
        ) -> Result<Option<ChatSessionDetail>, ChatError> {
            Ok(self
                .sessions
                .get(&(subject.to_string(), id.to_string()))
                .filter(|e| e.is_active)
                .map(|e| e.clone()))
        }

        async fn append(
            &self,
            subject: &str,
            id: &str,
            message: StoredMessage,
        ) -> Result<bool, ChatError> {
            match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
                Some(mut entry) if entry.is_active => {
                    entry.messages.push(message);
                    entry.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn rename(&self, subject: &str, id: &str, title: &str) -> Result<bool, ChatError> {
            match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
                Some(mut entry) => {
                    entry.title = title.to_string();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn soft_delete(&self, subject: &str, id: &str) -> Result<bool, ChatError> {
            match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
                Some(mut entry) => {
                    entry.is_active = false;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    // ---- helpers ----------------------------------------------------------

    type TestOrchestrator =
        ChatOrchestrator<ScriptedValidator, ScriptedEngine, ScriptedInvoker, MapChatStore>;

    fn orchestrator(
        validator: ScriptedValidator,
        engine: ScriptedEngine,
        invoker: ScriptedInvoker,
    ) -> TestOrchestrator {
        ChatOrchestrator::new(
            Arc::new(validator),
            Arc::new(engine),
            Arc::new(invoker),
            Arc::new(ChatHistoryService::new(MapChatStore::default())),
            OrchestratorConfig::default(),
        )
    }

    fn no_tools() -> ScriptedInvoker {
        ScriptedInvoker { tools: Vec::new() }
    }

    // ---- tests ------------------------------------------------------------

    #[tokio::test]
    async fn direct_reply_completes_in_one_round() {
        let orchestrator = orchestrator(
            ScriptedValidator::always(),
            ScriptedEngine::new(vec![EngineReply::Direct("Hello Ada!".into())]),
            no_tools(),
        );

        let outcome = orchestrator
            .run_turn("token", "chat-1", "hi", Map::new(), TurnCancel::never())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Hello Ada!");
        assert_eq!(outcome.tool_round_trips, 0);
        // Turn transcript: the user message and the reply.
        assert_eq!(outcome.transcript.len(), 2);
        assert_eq!(outcome.transcript[0].role, ChatRole::User);
        assert_eq!(outcome.transcript[1].role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn tool_round_folds_result_into_transcript_with_matching_correlation_id() {
        let engine = ScriptedEngine::new(vec![
            ScriptedEngine::tool_call("list_calendar_events", json!({"date": "today"})),
            EngineReply::Direct("You have a 10am standup and a 2pm review.".into()),
        ]);
        let invoker = ScriptedInvoker {
            tools: vec![(
                ScriptedInvoker::descriptor("list_calendar_events", false),
                ToolScript::Ok {
                    payload: json!({"events": ["standup", "review"]}),
                    delay_ms: 0,
                },
            )],
        };
        let orchestrator = orchestrator(ScriptedValidator::always(), engine, invoker);

        let outcome = orchestrator
            .run_turn(
                "token",
                "chat-1",
                "what meetings do I have today?",
                Map::new(),
                TurnCancel::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.tool_round_trips, 1);
        assert!(outcome.reply.contains("standup"));

        let tool_entries: Vec<_> = outcome
            .transcript
            .iter()
            .filter(|e| e.role == ChatRole::Tool)
            .collect();
        assert_eq!(tool_entries.len(), 1);

        // The tool entry's correlation id matches the one announced by the
        // preceding assistant entry.
        let announced = outcome
            .transcript
            .iter()
            .find(|e| e.role == ChatRole::Assistant && e.content.contains("tool_calls"))
            .expect("assistant entry requesting the tool");
        let correlation = tool_entries[0].correlation_id.unwrap();
        assert!(announced.content.contains(&correlation.to_string()));

        // The engine saw the tool result before producing the final reply.
        let seen = orchestrator.engine.seen_transcripts.lock().unwrap();
        let last_round = seen.last().unwrap();
        assert!(last_round.iter().any(|e| e.role == ChatRole::Tool));
    }

    #[tokio::test]
    async fn tool_timeout_is_survivable_conversational_information() {
        let engine = ScriptedEngine::new(vec![
            ScriptedEngine::tool_call("list_calendar_events", json!({})),
            EngineReply::Direct(
                "Sorry - I could not reach your calendar just now. Try again in a moment?".into(),
            ),
        ]);
        let invoker = ScriptedInvoker {
            tools: vec![(
                ScriptedInvoker::descriptor("list_calendar_events", false),
                ToolScript::TimedOut,
            )],
        };
        let orchestrator = orchestrator(ScriptedValidator::always(), engine, invoker);

        let outcome = orchestrator
            .run_turn("token", "chat-1", "meetings?", Map::new(), TurnCancel::never())
            .await
            .unwrap();

        assert!(outcome.reply.contains("could not reach"));
        let tool_entry = outcome
            .transcript
            .iter()
            .find(|e| e.role == ChatRole::Tool)
            .unwrap();
        assert!(tool_entry.content.contains("tool_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_round_appends_results_in_issue_order() {
        let engine = ScriptedEngine::new(vec![
            EngineReply::ToolCalls(vec![
                ToolCallIntent {
                    name: "slow_search".into(),
                    arguments: Map::new(),
                },
                ToolCallIntent {
                    name: "fast_search".into(),
                    arguments: Map::new(),
                },
            ]),
            EngineReply::Direct("done".into()),
        ]);
        let invoker = ScriptedInvoker {
            tools: vec![
                (
                    ScriptedInvoker::descriptor("slow_search", true),
                    ToolScript::Ok {
                        payload: json!("slow result"),
                        delay_ms: 200,
                    },
                ),
                (
                    ScriptedInvoker::descriptor("fast_search", true),
                    ToolScript::Ok {
                        payload: json!("fast result"),
                        delay_ms: 0,
                    },
                ),
            ],
        };
        let orchestrator = orchestrator(ScriptedValidator::always(), engine, invoker);

        let outcome = orchestrator
            .run_turn("token", "chat-1", "search both", Map::new(), TurnCancel::never())
            .await
            .unwrap();

        // B finished first, but A was issued first: A's entry precedes B's.
        let tool_entries: Vec<_> = outcome
            .transcript
            .iter()
            .filter(|e| e.role == ChatRole::Tool)
            .collect();
        assert_eq!(tool_entries.len(), 2);
        assert!(tool_entries[0].content.contains("slow result"));
        assert!(tool_entries[1].content.contains("fast result"));
    }

    #[tokio::test]
    async fn round_ceiling_forces_a_best_effort_reply() {
        // An engine that never stops asking for tools.
        let replies: Vec<EngineReply> = (0..10)
            .map(|_| ScriptedEngine::tool_call("list_calendar_events", json!({})))
            .collect();
        let invoker = ScriptedInvoker {
            tools: vec![(
                ScriptedInvoker::descriptor("list_calendar_events", false),
                ToolScript::Ok {
                    payload: json!([]),
                    delay_ms: 0,
                },
            )],
        };
        let orchestrator = orchestrator(ScriptedValidator::always(), ScriptedEngine::new(replies), invoker);

        let outcome = orchestrator
            .run_turn("token", "chat-1", "loop forever", Map::new(), TurnCancel::never())
            .await
            .unwrap();

        assert_eq!(outcome.tool_round_trips, 5);
        assert!(outcome.reply.contains("limit"));
    }

    #[tokio::test]
    async fn mid_turn_session_expiry_aborts_the_turn() {
        let engine = ScriptedEngine::new(vec![
            ScriptedEngine::tool_call("list_calendar_events", json!({})),
            EngineReply::Direct("never reached".into()),
        ]);
        let invoker = ScriptedInvoker {
            tools: vec![(
                ScriptedInvoker::descriptor("list_calendar_events", false),
                ToolScript::Ok {
                    payload: json!([]),
                    delay_ms: 0,
                },
            )],
        };
        // First validate (turn entry) passes; the pre-dispatch check fails.
        let orchestrator = orchestrator(ScriptedValidator::until(1), engine, invoker);

        let err = orchestrator
            .run_turn("token", "chat-1", "meetings?", Map::new(), TurnCancel::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Auth(AuthError::SessionExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_turn_aborts_in_flight_dispatch() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::tool_call(
            "stuck_tool",
            json!({}),
        )]);
        let invoker = ScriptedInvoker {
            tools: vec![(
                ScriptedInvoker::descriptor("stuck_tool", false),
                ToolScript::Hang,
            )],
        };
        let orchestrator = Arc::new(orchestrator(ScriptedValidator::always(), engine, invoker));

        let (handle, cancel) = TurnCancel::pair();
        let turn = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .run_turn("token", "chat-1", "hang", Map::new(), cancel)
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = turn.await.unwrap().unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
    }

    #[tokio::test]
    async fn turns_for_one_chat_do_not_interleave() {
        let engine = ScriptedEngine::new(vec![
            EngineReply::Direct("first".into()),
            EngineReply::Direct("second".into()),
        ]);
        let orchestrator = Arc::new(orchestrator(ScriptedValidator::always(), engine, no_tools()));

        let a = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .run_turn("token", "chat-1", "one", Map::new(), TurnCancel::never())
                    .await
            })
        };
        let b = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .run_turn("token", "chat-1", "two", Map::new(), TurnCancel::never())
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Serialized turns leave a strictly alternating history.
        let detail = orchestrator
            .history
            .session_detail("u1", "chat-1")
            .await
            .unwrap();
        let roles: Vec<ChatRole> = detail.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::User,
                ChatRole::Assistant
            ]
        );
    }
}
