//! Model-backed agent worker.
//!
//! A [`ModelAgent`] registers itself on the bus and answers task REQUESTs by
//! calling its language model. Its conversation history is private to the
//! agent; the only state it shares is notes broadcast on topics it was
//! explicitly configured to share.

use crate::protocol::{from_message, to_payload, ReplyPayload, TaskPayload, FIELD_NOTE};
use async_trait::async_trait;
use concord_bus::{MessageBus, MessageHandler};
use concord_core::{AgentId, AgentMessage, ConcordResult, MessageType, Payload};
use concord_llm::{estimate_tokens, GenerateOptions, LanguageModel};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

const DEFAULT_CONFIDENCE: f64 = 0.7;
const DEFAULT_MAX_HISTORY: usize = 8;
const MAX_NOTES: usize = 32;

#[derive(Debug, Default)]
struct AgentMemory {
    /// (task, answer) pairs, oldest first
    history: VecDeque<(String, String)>,
    notes: VecDeque<String>,
}

/// Agent that answers tasks with a language model.
pub struct ModelAgent {
    agent_id: AgentId,
    agent_type: String,
    capabilities: Vec<String>,
    model: Arc<dyn LanguageModel>,
    model_name: String,
    options: GenerateOptions,
    default_confidence: f64,
    max_history: usize,
    shared_topics: Vec<String>,
    memory: Mutex<AgentMemory>,
}

impl ModelAgent {
    pub fn new(
        agent_id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            model,
            model_name: "default".to_string(),
            options: GenerateOptions::default(),
            default_confidence: DEFAULT_CONFIDENCE,
            max_history: DEFAULT_MAX_HISTORY,
            shared_topics: Vec::new(),
            memory: Mutex::new(AgentMemory::default()),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Confidence reported when the model does not state one.
    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = concord_core::clamp_unit(confidence);
        self
    }

    /// Number of past exchanges replayed into each prompt.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Share notes with other agents subscribed to `topic`.
    pub fn with_shared_topic(mut self, topic: impl Into<String>) -> Self {
        self.shared_topics.push(topic.into());
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn memory(&self) -> MutexGuard<'_, AgentMemory> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn history_len(&self) -> usize {
        self.memory().history.len()
    }

    /// Notes received on shared topics, oldest first.
    pub fn notes(&self) -> Vec<String> {
        self.memory().notes.iter().cloned().collect()
    }

    /// Register on the bus and subscribe to the shared topics.
    pub async fn attach(self: &Arc<Self>, bus: &MessageBus) -> ConcordResult<()> {
        let handler: Arc<dyn MessageHandler> = self.clone();
        bus.register(
            &self.agent_id,
            &self.agent_type,
            handler,
            self.capabilities.clone(),
        )
        .await?;
        for topic in &self.shared_topics {
            bus.subscribe(&self.agent_id, topic)?;
        }
        Ok(())
    }

    /// Broadcast a note to every agent sharing `topic`.
    pub async fn share_note(
        &self,
        bus: &MessageBus,
        topic: &str,
        note: impl Into<String>,
    ) -> ConcordResult<()> {
        let mut payload = Payload::new();
        payload.insert(FIELD_NOTE.to_string(), note.into().into());
        bus.broadcast(&self.agent_id, topic, payload).await
    }

    fn build_prompt(&self, task: &TaskPayload) -> String {
        let memory = self.memory();
        let mut prompt = format!("You are the {} agent ({}).\n", self.agent_type, self.agent_id);

        if !memory.notes.is_empty() {
            prompt.push_str("Shared notes:\n");
            for note in &memory.notes {
                let _ = writeln!(prompt, "- {note}");
            }
        }
        let skip = memory.history.len().saturating_sub(self.max_history);
        for (past_task, answer) in memory.history.iter().skip(skip) {
            let _ = writeln!(prompt, "Earlier task: {past_task}\nYour answer: {answer}");
        }
        if !task.context.is_empty() {
            prompt.push_str("Context:\n");
            for (key, value) in &task.context {
                match value.as_str() {
                    Some(s) => {
                        let _ = writeln!(prompt, "{key}: {s}");
                    }
                    None => {
                        let _ = writeln!(prompt, "{key}: {value}");
                    }
                }
            }
        }
        prompt.push_str("Task:\n");
        prompt.push_str(&task.task);
        prompt
    }

    async fn answer(&self, bus: &MessageBus, request: &AgentMessage) -> ConcordResult<()> {
        let task: TaskPayload = from_message(request)?;
        let prompt = self.build_prompt(&task);
        let started = Instant::now();

        let raw = self
            .model
            .generate(&self.model_name, &prompt, &self.options)
            .await?;
        let (content, confidence) = split_confidence(&raw, self.default_confidence);
        let latency_ms = started.elapsed().as_millis() as u64;
        let tokens_used = estimate_tokens(&prompt) + estimate_tokens(&raw);

        {
            let mut memory = self.memory();
            memory.history.push_back((task.task.clone(), content.clone()));
            while memory.history.len() > self.max_history {
                memory.history.pop_front();
            }
        }

        tracing::debug!(
            agent_id = %self.agent_id,
            request_id = %task.request_id,
            tokens_used,
            latency_ms,
            confidence,
            "Agent answered task"
        );

        let reply = ReplyPayload {
            content,
            confidence,
            tokens_used,
            latency_ms,
            agent_type: self.agent_type.clone(),
        };
        bus.respond(request, to_payload(&reply)?).await?;
        Ok(())
    }

    fn remember_note(&self, message: &AgentMessage) {
        let Some(note) = message.payload_str(FIELD_NOTE) else {
            return;
        };
        let mut memory = self.memory();
        memory.notes.push_back(format!("{}: {note}", message.from));
        while memory.notes.len() > MAX_NOTES {
            memory.notes.pop_front();
        }
    }
}

#[async_trait]
impl MessageHandler for ModelAgent {
    async fn handle(&self, bus: &MessageBus, message: AgentMessage) -> ConcordResult<()> {
        match message.message_type {
            MessageType::Request => self.answer(bus, &message).await,
            MessageType::Broadcast | MessageType::Event
                if message.from != self.agent_id && self.shared_topics.contains(&message.topic) =>
            {
                self.remember_note(&message);
                Ok(())
            }
            _ => {
                tracing::trace!(
                    agent_id = %self.agent_id,
                    topic = %message.topic,
                    "Ignoring message"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ModelAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAgent")
            .field("agent_id", &self.agent_id)
            .field("agent_type", &self.agent_type)
            .field("provider", &self.model.provider_id())
            .field("model_name", &self.model_name)
            .field("shared_topics", &self.shared_topics)
            .finish()
    }
}

/// Split a trailing `confidence: <number>` line off a model answer.
///
/// Returns the remaining content and the stated confidence clamped to
/// `[0, 1]`, or `default` when no such line is present.
pub fn split_confidence(raw: &str, default: f64) -> (String, f64) {
    let trimmed = raw.trim_end();
    let (body, last) = trimmed.rsplit_once('\n').unwrap_or(("", trimmed));
    let stated = last
        .trim()
        .to_lowercase()
        .strip_prefix("confidence:")
        .and_then(|value| value.trim().parse::<f64>().ok());
    match stated {
        Some(c) => (body.trim_end().to_string(), concord_core::clamp_unit(c)),
        None => (trimmed.to_string(), default),
    }
}

/// Refresh an agent's heartbeat every `period` until shutdown is signalled.
pub async fn heartbeat_task(
    bus: MessageBus,
    agent_id: AgentId,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = bus.heartbeat(&agent_id) {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Heartbeat rejected, stopping");
                    break;
                }
            }
        }
    }
    tracing::debug!(agent_id = %agent_id, "Heartbeat loop stopped");
}

/// Spawn [`heartbeat_task`] for an agent.
pub fn spawn_heartbeat(
    bus: &MessageBus,
    agent_id: impl Into<AgentId>,
    period: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_task(bus.clone(), agent_id.into(), period, shutdown_rx))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TOPIC_TASK;
    use concord_core::BusConfig;
    use concord_llm::MockLanguageModel;

    fn task_payload(task: &str) -> Payload {
        to_payload(&TaskPayload {
            request_id: "r1".to_string(),
            task: task.to_string(),
            context: Payload::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_split_confidence() {
        assert_eq!(
            split_confidence("Answer here.\nConfidence: 0.85", 0.5),
            ("Answer here.".to_string(), 0.85)
        );
        assert_eq!(
            split_confidence("No stated confidence.", 0.5),
            ("No stated confidence.".to_string(), 0.5)
        );
        assert_eq!(split_confidence("confidence: 7", 0.5), (String::new(), 1.0));
        assert_eq!(
            split_confidence("Body\nconfidence: high", 0.4),
            ("Body\nconfidence: high".to_string(), 0.4)
        );
    }

    #[tokio::test]
    async fn test_agent_answers_task_request() {
        let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
        let agent = Arc::new(ModelAgent::new(
            "writer-1",
            "writer",
            Arc::new(MockLanguageModel::with_prefix("Draft: ")),
        ));
        agent.attach(&bus).await.unwrap();

        let reply = bus
            .call(
                "orchestrator",
                "writer-1",
                TOPIC_TASK,
                task_payload("Describe the release"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let reply: ReplyPayload = from_message(&reply).unwrap();
        assert_eq!(reply.content, "Draft: Describe the release");
        assert_eq!(reply.agent_type, "writer");
        assert_eq!(reply.confidence, DEFAULT_CONFIDENCE);
        assert!(reply.tokens_used > 0);
        assert_eq!(agent.history_len(), 1);
    }

    #[test]
    fn test_history_is_bounded_and_replayed() {
        let agent = ModelAgent::new("a", "t", Arc::new(MockLanguageModel::new())).with_max_history(1);
        {
            let mut memory = agent.memory();
            memory.history.push_back(("first".to_string(), "one".to_string()));
            memory.history.push_back(("second".to_string(), "two".to_string()));
        }
        let prompt = agent.build_prompt(&TaskPayload {
            request_id: "r".to_string(),
            task: "third".to_string(),
            context: Payload::new(),
        });
        assert!(prompt.contains("Earlier task: second"));
        assert!(!prompt.contains("Earlier task: first"));
        assert!(prompt.ends_with("Task:\nthird"));
    }

    #[tokio::test]
    async fn test_notes_only_from_shared_topics() {
        let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
        let model: Arc<dyn LanguageModel> = Arc::new(MockLanguageModel::new());
        let reader = Arc::new(ModelAgent::new("reader", "r", model.clone()).with_shared_topic("team"));
        let writer = Arc::new(ModelAgent::new("writer", "w", model).with_shared_topic("team"));
        reader.attach(&bus).await.unwrap();
        writer.attach(&bus).await.unwrap();

        writer.share_note(&bus, "team", "use metric units").await.unwrap();
        writer.share_note(&bus, "elsewhere", "private").await.unwrap();

        for _ in 0..100 {
            if !reader.notes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reader.notes(), vec!["writer: use metric units".to_string()]);
        assert!(writer.notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_agent_live() {
        let bus = MessageBus::in_memory(BusConfig::default()).unwrap();
        let agent = Arc::new(ModelAgent::new("a", "t", Arc::new(MockLanguageModel::new())));
        agent.attach(&bus).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_heartbeat(&bus, "a", Duration::from_secs(20), shutdown_rx);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(bus.is_live("a"));

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(!bus.is_live("a"));
    }
}
