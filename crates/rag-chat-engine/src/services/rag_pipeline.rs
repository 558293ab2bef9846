use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{Reloadable, TuningConfig};
use crate::providers::{
    EmbeddingProvider, KeywordSearchProvider, LlmMessage, LlmProvider, RerankResult,
    RerankerProvider, SearchHit, Usage, VectorStoreProvider,
};
use crate::services::confidence::{ConfidenceScorer, ConfidenceTier};
use crate::services::escalation::EscalationSink;
use crate::services::events::{ChatEvent, ChatEventStream, SourceRef};
use crate::services::fusion::{reciprocal_rank_fusion, FusedHit};
use crate::services::persona::PersonaService;
use crate::services::session::ConversationStore;
use crate::utils::error::EngineError;

const GENERIC_ERROR_DETAIL: &str = "An error occurred processing your request.";
const MAX_QUERY_CHARS: usize = 5000;
const REWRITE_MAX_TOKENS: usize = 150;
const REWRITE_CONTEXT_MESSAGES: usize = 4;
const GENERATION_CONTEXT_MESSAGES: usize = 6;
const SOURCE_JOIN_PREFIX: usize = 100;
const TOPIC_HEAD_CHARS: usize = 60;
const EVENT_CHANNEL_CAPACITY: usize = 32;

const REWRITE_SYSTEM_PROMPT: &str = "Rewrite the user's latest question as a standalone \
search query. Incorporate relevant context from the conversation. Output ONLY the \
rewritten query, nothing else.";

/// A pipeline step either failed with a real error or lost its consumer.
/// Cancellation stops the run without persisting the partial turn.
enum StepError {
    Engine(EngineError),
    Cancelled,
}

impl From<EngineError> for StepError {
    fn from(e: EngineError) -> Self {
        StepError::Engine(e)
    }
}

/// Query-time orchestration: context -> rewrite -> dual retrieval ->
/// fuse -> rerank -> score -> route -> stream. `run` returns a typed
/// event stream; the producer task is cancelled when the consumer drops
/// the stream, which in turn drops any in-flight LLM call.
#[derive(Clone)]
pub struct QueryPipeline {
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStoreProvider>,
    keyword_search: Arc<dyn KeywordSearchProvider>,
    reranker: Arc<dyn RerankerProvider>,
    sessions: Arc<dyn ConversationStore>,
    escalations: Arc<dyn EscalationSink>,
    persona: Arc<Reloadable<PersonaService>>,
    tuning: Arc<Reloadable<TuningConfig>>,
}

impl QueryPipeline {
    /// Startup binding: resolve the concrete provider variants for this
    /// deployment. No dynamic re-binding happens after this.
    pub fn from_settings(
        settings: &crate::config::Settings,
        repository: Arc<crate::database::Repository>,
        persona: Arc<Reloadable<PersonaService>>,
        tuning: Arc<Reloadable<TuningConfig>>,
    ) -> Self {
        use crate::providers::{
            EmbeddingClient, HttpReranker, OpenAiLlmClient, PgVectorStore, PostgresFtsProvider,
        };
        use crate::services::escalation::EscalationService;
        use crate::services::session::SessionManager;

        let pool = repository.pool().clone();

        Self::new(
            Arc::new(OpenAiLlmClient::new(settings.llm.clone())),
            Arc::new(EmbeddingClient::new(settings.embedding.clone())),
            Arc::new(PgVectorStore::new(pool.clone())),
            Arc::new(PostgresFtsProvider::new(pool)),
            Arc::new(HttpReranker::new(settings.reranker.clone())),
            Arc::new(SessionManager::new(repository.clone())),
            Arc::new(EscalationService::new(
                repository,
                settings.escalation.clone(),
            )),
            persona,
            tuning,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStoreProvider>,
        keyword_search: Arc<dyn KeywordSearchProvider>,
        reranker: Arc<dyn RerankerProvider>,
        sessions: Arc<dyn ConversationStore>,
        escalations: Arc<dyn EscalationSink>,
        persona: Arc<Reloadable<PersonaService>>,
        tuning: Arc<Reloadable<TuningConfig>>,
    ) -> Self {
        Self {
            llm,
            embeddings,
            vector_store,
            keyword_search,
            reranker,
            sessions,
            escalations,
            persona,
            tuning,
        }
    }

    /// Validates the query and starts the producer task. The caller must
    /// have persisted the user message before invoking this.
    pub fn run(&self, query: &str, session_id: Uuid) -> Result<ChatEventStream, EngineError> {
        let length = query.chars().count();
        if length == 0 {
            return Err(EngineError::Validation("query must not be empty".into()));
        }
        if length > MAX_QUERY_CHARS {
            return Err(EngineError::Validation(format!(
                "query exceeds {MAX_QUERY_CHARS} characters"
            )));
        }

        let (tx, rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);
        let pipeline = self.clone();
        let query = query.to_string();

        tokio::spawn(async move {
            match pipeline.execute(&tx, &query, session_id).await {
                Ok(()) => {}
                Err(StepError::Cancelled) => {
                    debug!(session_id = %session_id, "event_consumer_disconnected");
                }
                Err(StepError::Engine(e)) => {
                    error!(session_id = %session_id, error = %e, "query_pipeline_failed");
                    let _ = tx
                        .send_async(ChatEvent::Error {
                            detail: GENERIC_ERROR_DETAIL.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(Box::pin(rx.into_stream()))
    }

    async fn emit(&self, tx: &flume::Sender<ChatEvent>, event: ChatEvent) -> Result<(), StepError> {
        tx.send_async(event).await.map_err(|_| StepError::Cancelled)
    }

    async fn execute(
        &self,
        tx: &flume::Sender<ChatEvent>,
        query: &str,
        session_id: Uuid,
    ) -> Result<(), StepError> {
        let tuning = self.tuning.snapshot();
        let persona = self.persona.snapshot();
        let message_id = Uuid::new_v4();

        // 1. Conversation context. The current user message is already
        // persisted by the caller.
        let context = self
            .sessions
            .get_context_messages(session_id, tuning.retrieval.max_turns)
            .await?;

        // 2. Query rewrite when there is context to fold in.
        let search_query = if context.is_empty() {
            query.to_string()
        } else {
            let rewritten = self.rewrite_query(query, &context).await?;
            info!(session_id = %session_id, original = query, rewritten = %rewritten, "query_rewritten");
            rewritten
        };

        // 3. Parallel retrieval over both modalities.
        let (semantic, keyword) = tokio::join!(
            self.search_semantic(&search_query, tuning.retrieval.semantic_top_k),
            self.search_keyword(&search_query, tuning.retrieval.keyword_top_k),
        );
        let (semantic, keyword) = (semantic?, keyword?);

        // 4. Reciprocal Rank Fusion.
        let fused = reciprocal_rank_fusion(vec![semantic, keyword], tuning.retrieval.rrf_k);

        if fused.is_empty() {
            self.emit(
                tx,
                ChatEvent::Metadata {
                    session_id,
                    confidence_tier: ConfidenceTier::OffTopic.as_str().to_string(),
                    message_id,
                },
            )
            .await?;
            let message = persona.get_off_topic_message();
            return self
                .finish_canned(tx, session_id, message_id, ConfidenceTier::OffTopic, message)
                .await;
        }

        // 5. Rerank the fused head.
        let candidates: Vec<String> = fused
            .iter()
            .take(tuning.retrieval.rerank_top_k * 3)
            .map(|f| f.text.clone())
            .collect();
        let reranked = self
            .reranker
            .rerank(&search_query, candidates, tuning.retrieval.rerank_top_k)
            .await?;

        // 6. Confidence scoring.
        let scorer = ConfidenceScorer::new(tuning.confidence.clone());
        let confidence = scorer.score(&reranked);
        info!(
            session_id = %session_id,
            tier = confidence.tier.as_str(),
            top_score = confidence.top_score,
            variance = confidence.score_variance,
            "confidence_scored"
        );

        self.emit(
            tx,
            ChatEvent::Metadata {
                session_id,
                confidence_tier: confidence.tier.as_str().to_string(),
                message_id,
            },
        )
        .await?;

        // 7. Route by tier.
        match confidence.tier {
            ConfidenceTier::OffTopic => {
                let message = persona.get_off_topic_message();
                self.finish_canned(tx, session_id, message_id, confidence.tier, message)
                    .await
            }
            ConfidenceTier::Escalate => {
                let message = persona.get_escalation_message();
                self.emit(
                    tx,
                    ChatEvent::Delta {
                        content: message.clone(),
                    },
                )
                .await?;
                self.emit(tx, ChatEvent::Sources(Vec::new())).await?;
                self.emit(
                    tx,
                    ChatEvent::Done {
                        usage: Usage::default(),
                    },
                )
                .await?;

                // The webhook outcome never blocks the stream.
                if let Err(e) = self
                    .escalations
                    .escalate(session_id, query, "low_confidence", Some(message_id))
                    .await
                {
                    error!(session_id = %session_id, error = %e, "escalation_failed");
                }

                self.sessions
                    .save_assistant_message(
                        session_id,
                        message_id,
                        &message,
                        confidence.tier.as_str(),
                        None,
                        None,
                    )
                    .await?;
                Ok(())
            }
            ConfidenceTier::Decline => {
                let message = persona.get_fallback_message();
                self.finish_canned(tx, session_id, message_id, confidence.tier, message)
                    .await
            }
            ConfidenceTier::Ambiguous => {
                let topics = topic_candidates(&reranked);
                let message = persona.build_ambiguity_prompt(&topics);
                self.finish_canned(tx, session_id, message_id, confidence.tier, message)
                    .await
            }
            ConfidenceTier::Answer | ConfidenceTier::Caveat => {
                self.generate_answer(
                    tx,
                    session_id,
                    message_id,
                    query,
                    &context,
                    &reranked,
                    &fused,
                    confidence.tier,
                    &persona,
                )
                .await
            }
        }
    }

    /// ANSWER / CAVEAT: stream the grounded generation.
    #[allow(clippy::too_many_arguments)]
    async fn generate_answer(
        &self,
        tx: &flume::Sender<ChatEvent>,
        session_id: Uuid,
        message_id: Uuid,
        query: &str,
        context: &[LlmMessage],
        reranked: &[RerankResult],
        fused: &[FusedHit],
        tier: ConfidenceTier,
        persona: &PersonaService,
    ) -> Result<(), StepError> {
        let sources = build_sources(reranked, fused);
        let system_prompt = persona.build_system_prompt(&sources, tier.as_str());

        let mut messages = vec![LlmMessage::new("system", system_prompt)];
        let tail = context.len().saturating_sub(GENERATION_CONTEXT_MESSAGES);
        messages.extend_from_slice(&context[tail..]);
        messages.push(LlmMessage::new("user", query));

        let mut token_stream = self.llm.stream(messages, None, None).await?;
        let mut full_response = String::new();

        while let Some(token) = token_stream.next().await {
            let token = token?;
            full_response.push_str(&token);
            self.emit(tx, ChatEvent::Delta { content: token }).await?;
        }

        self.emit(
            tx,
            ChatEvent::Sources(sources.iter().map(|s| s.truncated()).collect()),
        )
        .await?;
        self.emit(
            tx,
            ChatEvent::Done {
                usage: Usage::default(),
            },
        )
        .await?;

        let sources_json = serde_json::to_value(&sources).ok();
        self.sessions
            .save_assistant_message(
                session_id,
                message_id,
                &full_response,
                tier.as_str(),
                sources_json,
                None,
            )
            .await?;

        Ok(())
    }

    /// Canned routes share the same tail: one delta, empty sources, done,
    /// persist.
    async fn finish_canned(
        &self,
        tx: &flume::Sender<ChatEvent>,
        session_id: Uuid,
        message_id: Uuid,
        tier: ConfidenceTier,
        message: String,
    ) -> Result<(), StepError> {
        self.emit(
            tx,
            ChatEvent::Delta {
                content: message.clone(),
            },
        )
        .await?;
        self.emit(tx, ChatEvent::Sources(Vec::new())).await?;
        self.emit(
            tx,
            ChatEvent::Done {
                usage: Usage::default(),
            },
        )
        .await?;

        self.sessions
            .save_assistant_message(session_id, message_id, &message, tier.as_str(), None, None)
            .await?;

        Ok(())
    }

    async fn rewrite_query(
        &self,
        query: &str,
        context: &[LlmMessage],
    ) -> Result<String, EngineError> {
        let mut messages = vec![LlmMessage::new("system", REWRITE_SYSTEM_PROMPT)];
        let tail = context.len().saturating_sub(REWRITE_CONTEXT_MESSAGES);
        messages.extend_from_slice(&context[tail..]);
        messages.push(LlmMessage::new("user", query));

        let response = self
            .llm
            .complete(messages, None, Some(REWRITE_MAX_TOKENS))
            .await?;

        let rewritten = response.content.trim().to_string();
        Ok(if rewritten.is_empty() {
            query.to_string()
        } else {
            rewritten
        })
    }

    async fn search_semantic(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let embedding = self.embeddings.embed_query(query).await?;
        self.vector_store.search(embedding, top_k, None).await
    }

    async fn search_keyword(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        self.keyword_search.search(query, top_k, None).await
    }
}

/// Join reranked texts back to fused records by text prefix to recover
/// title and source URI.
fn build_sources(reranked: &[RerankResult], fused: &[FusedHit]) -> Vec<SourceRef> {
    let fused_by_prefix: HashMap<String, &FusedHit> = fused
        .iter()
        .map(|f| (f.text.chars().take(SOURCE_JOIN_PREFIX).collect(), f))
        .collect();

    reranked
        .iter()
        .map(|r| {
            let prefix: String = r.text.chars().take(SOURCE_JOIN_PREFIX).collect();
            let metadata = fused_by_prefix.get(&prefix).map(|f| &f.metadata);

            let title = metadata
                .and_then(|m| m.get("title"))
                .and_then(|v| v.as_str())
                .unwrap_or("Document")
                .to_string();
            let url = metadata
                .and_then(|m| m.get("source_uri"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());

            SourceRef {
                title,
                text: r.text.clone(),
                url,
                score: r.score,
            }
        })
        .collect()
}

/// Topic hints for the ambiguity clarification: first line of the top
/// three reranked texts, deduplicated in rank order.
fn topic_candidates(reranked: &[RerankResult]) -> Vec<String> {
    let mut topics = Vec::new();
    for result in reranked.iter().take(3) {
        let head: String = result.text.chars().take(TOPIC_HEAD_CHARS).collect();
        let topic = head.split('\n').next().unwrap_or("").trim().to_string();
        if !topic.is_empty() && !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    topics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfidenceConfig, PersonaConfig, RetrievalConfig};
    use crate::providers::{
        LlmResponse, MockEmbeddingProvider, MockKeywordSearchProvider, MockLlmProvider,
        MockRerankerProvider, MockVectorStoreProvider,
    };
    use crate::services::escalation::MockEscalationSink;
    use crate::services::session::MockConversationStore;
    use serde_json::json;

    struct Mocks {
        llm: MockLlmProvider,
        embeddings: MockEmbeddingProvider,
        vector_store: MockVectorStoreProvider,
        keyword_search: MockKeywordSearchProvider,
        reranker: MockRerankerProvider,
        sessions: MockConversationStore,
        escalations: MockEscalationSink,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                llm: MockLlmProvider::new(),
                embeddings: MockEmbeddingProvider::new(),
                vector_store: MockVectorStoreProvider::new(),
                keyword_search: MockKeywordSearchProvider::new(),
                reranker: MockRerankerProvider::new(),
                sessions: MockConversationStore::new(),
                escalations: MockEscalationSink::new(),
            }
        }

        fn build(self) -> QueryPipeline {
            let persona = PersonaService::new(PersonaConfig {
                company_name: "TestCorp".into(),
                product_name: "TestDryer".into(),
                tone: "friendly".into(),
                template_path: "does/not/exist.yaml".into(),
            });
            QueryPipeline::new(
                Arc::new(self.llm),
                Arc::new(self.embeddings),
                Arc::new(self.vector_store),
                Arc::new(self.keyword_search),
                Arc::new(self.reranker),
                Arc::new(self.sessions),
                Arc::new(self.escalations),
                Arc::new(Reloadable::new(persona)),
                Arc::new(Reloadable::new(TuningConfig {
                    retrieval: RetrievalConfig::default(),
                    confidence: ConfidenceConfig::default(),
                    persona: PersonaConfig::default(),
                })),
            )
        }
    }

    fn lint_trap_hit() -> SearchHit {
        SearchHit {
            chunk_id: Uuid::new_v4(),
            text: "To clean the lint trap, open the door and pull the screen up.".into(),
            score: 0.8,
            metadata: json!({"title": "Dryer Manual", "source_uri": "/kb/dryer-manual.md"}),
        }
    }

    fn empty_context(mocks: &mut Mocks) {
        mocks
            .sessions
            .expect_get_context_messages()
            .returning(|_, _| Ok(Vec::new()));
    }

    fn expect_save(mocks: &mut Mocks, tier: &'static str) {
        mocks
            .sessions
            .expect_save_assistant_message()
            .withf(move |_, _, _, saved_tier, _, _| saved_tier == tier)
            .times(1)
            .returning(|_, _, _, _, _, _| Ok(()));
    }

    async fn collect(pipeline: &QueryPipeline, query: &str) -> Vec<ChatEvent> {
        pipeline
            .run(query, Uuid::new_v4())
            .unwrap()
            .collect::<Vec<_>>()
            .await
    }

    fn metadata_tier(events: &[ChatEvent]) -> &str {
        match &events[0] {
            ChatEvent::Metadata {
                confidence_tier, ..
            } => confidence_tier,
            other => panic!("first event was not metadata: {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_confidence_query_streams_an_answer() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        let hit = lint_trap_hit();
        let text = hit.text.clone();
        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        {
            let hit = hit.clone();
            mocks
                .vector_store
                .expect_search()
                .returning(move |_, _, _| Ok(vec![hit.clone()]));
        }
        {
            let hit = hit.clone();
            mocks
                .keyword_search
                .expect_search()
                .returning(move |_, _, _| Ok(vec![hit.clone()]));
        }
        {
            let text = text.clone();
            mocks.reranker.expect_rerank().returning(move |_, _, _| {
                Ok(vec![RerankResult {
                    index: 0,
                    score: 0.92,
                    text: text.clone(),
                }])
            });
        }
        mocks.llm.expect_stream().returning(|_, _, _| {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok("Open ".to_string()),
                Ok("the door.".to_string()),
            ])))
        });
        expect_save(&mut mocks, "ANSWER");

        let events = collect(&mocks.build(), "How do I clean the lint trap?").await;

        assert_eq!(metadata_tier(&events), "ANSWER");
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Delta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Open ", "the door."]);

        let sources = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::Sources(list) => Some(list),
                _ => None,
            })
            .expect("sources event missing");
        assert!(!sources.is_empty());
        assert_eq!(sources[0].title, "Dryer Manual");
        assert_eq!(sources[0].url.as_deref(), Some("/kb/dryer-manual.md"));

        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn low_confidence_query_escalates() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        let hit = lint_trap_hit();
        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        {
            let hit = hit.clone();
            mocks
                .vector_store
                .expect_search()
                .returning(move |_, _, _| Ok(vec![hit.clone()]));
        }
        mocks
            .keyword_search
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        mocks.reranker.expect_rerank().returning(|_, _, _| {
            Ok(vec![
                RerankResult {
                    index: 0,
                    score: 0.23,
                    text: "Tax rules for widgets".into(),
                },
                RerankResult {
                    index: 1,
                    score: 0.21,
                    text: "Unrelated policy".into(),
                },
            ])
        });
        mocks
            .escalations
            .expect_escalate()
            .withf(|_, _, reason, message_id| reason == "low_confidence" && message_id.is_some())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        expect_save(&mut mocks, "ESCALATE");

        let events = collect(
            &mocks.build(),
            "What is the tax deduction for blue widgets?",
        )
        .await;

        assert_eq!(metadata_tier(&events), "ESCALATE");
        assert!(matches!(
            &events[1],
            ChatEvent::Delta { content } if content.contains("human agent")
        ));
        assert!(matches!(&events[2], ChatEvent::Sources(list) if list.is_empty()));
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn irrelevant_results_are_off_topic() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        let hit = lint_trap_hit();
        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        {
            let hit = hit.clone();
            mocks
                .vector_store
                .expect_search()
                .returning(move |_, _, _| Ok(vec![hit.clone()]));
        }
        mocks
            .keyword_search
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        mocks.reranker.expect_rerank().returning(|_, _, _| {
            Ok(vec![RerankResult {
                index: 0,
                score: 0.10,
                text: "Dryer installation".into(),
            }])
        });
        expect_save(&mut mocks, "OFF_TOPIC");

        let events = collect(&mocks.build(), "What's the capital of France?").await;

        assert_eq!(metadata_tier(&events), "OFF_TOPIC");
        assert!(matches!(
            &events[1],
            ChatEvent::Delta { content } if content.contains("TestDryer")
        ));
        assert!(matches!(&events[2], ChatEvent::Sources(list) if list.is_empty()));
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn close_scores_across_topics_ask_for_clarification() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        let hit = lint_trap_hit();
        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        {
            let hit = hit.clone();
            mocks
                .vector_store
                .expect_search()
                .returning(move |_, _, _| Ok(vec![hit.clone()]));
        }
        mocks
            .keyword_search
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        mocks.reranker.expect_rerank().returning(|_, _, _| {
            Ok(vec![
                RerankResult {
                    index: 0,
                    score: 0.70,
                    text: "Lint trap cleaning\nSteps follow.".into(),
                },
                RerankResult {
                    index: 1,
                    score: 0.69,
                    text: "Water filter replacement\nSteps follow.".into(),
                },
                RerankResult {
                    index: 2,
                    score: 0.68,
                    text: "Door latch adjustment\nSteps follow.".into(),
                },
            ])
        });
        expect_save(&mut mocks, "AMBIGUOUS");

        let events = collect(&mocks.build(), "How do I fix it?").await;

        assert_eq!(metadata_tier(&events), "AMBIGUOUS");
        match &events[1] {
            ChatEvent::Delta { content } => {
                assert!(content.contains("'Lint trap cleaning'"));
                assert!(content.contains("'Water filter replacement'"));
                assert!(content.contains("'Door latch adjustment'"));
                assert!(content.contains(" and "));
            }
            other => panic!("expected clarification delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_corpus_short_circuits_to_off_topic() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        mocks
            .vector_store
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        mocks
            .keyword_search
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        expect_save(&mut mocks, "OFF_TOPIC");
        // Reranker and LLM must not be called on the empty-fusion path;
        // unexpected mock calls panic.

        let events = collect(&mocks.build(), "Anything at all?").await;

        assert_eq!(metadata_tier(&events), "OFF_TOPIC");
        let deltas = events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Delta { .. }))
            .count();
        assert_eq!(deltas, 1);
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn provider_failure_yields_single_generic_error() {
        let mut mocks = Mocks::new();
        empty_context(&mut mocks);

        mocks
            .embeddings
            .expect_embed_query()
            .returning(|_| Err(EngineError::provider("embeddings", "connection refused")));
        mocks
            .keyword_search
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));

        let events = collect(&mocks.build(), "How do I clean the lint trap?").await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChatEvent::Error { detail } if detail == GENERIC_ERROR_DETAIL
        ));
    }

    #[tokio::test]
    async fn context_triggers_query_rewrite() {
        let mut mocks = Mocks::new();

        mocks.sessions.expect_get_context_messages().returning(|_, _| {
            Ok(vec![
                LlmMessage::new("user", "Tell me about the dryer."),
                LlmMessage::new("assistant", "It dries clothes."),
            ])
        });
        mocks
            .llm
            .expect_complete()
            .times(1)
            .returning(|_, _, _| {
                Ok(LlmResponse {
                    content: "dryer lint trap cleaning".into(),
                    usage: Usage::default(),
                    model: "test".into(),
                })
            });
        mocks
            .embeddings
            .expect_embed_query()
            .withf(|q| q == "dryer lint trap cleaning")
            .returning(|_| Ok(vec![0.1, 0.2, 0.3]));
        mocks
            .vector_store
            .expect_search()
            .returning(|_, _, _| Ok(Vec::new()));
        mocks
            .keyword_search
            .expect_search()
            .withf(|q, _, _| q == "dryer lint trap cleaning")
            .returning(|_, _, _| Ok(Vec::new()));
        expect_save(&mut mocks, "OFF_TOPIC");

        let events = collect(&mocks.build(), "How do I clean it?").await;
        assert_eq!(metadata_tier(&events), "OFF_TOPIC");
    }

    #[tokio::test]
    async fn empty_and_oversized_queries_are_rejected_upstream() {
        let pipeline = Mocks::new().build();
        assert!(matches!(
            pipeline.run("", Uuid::new_v4()),
            Err(EngineError::Validation(_))
        ));
        let oversized = "x".repeat(5001);
        assert!(matches!(
            pipeline.run(&oversized, Uuid::new_v4()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn sources_join_back_to_fused_metadata_by_prefix() {
        let fused = vec![FusedHit {
            chunk_id: Uuid::new_v4(),
            text: "To clean the lint trap, open the door and pull the screen up.".into(),
            score: 0.8,
            metadata: json!({"title": "Dryer Manual", "source_uri": "/kb/dryer-manual.md"}),
            rrf_score: 0.03,
        }];
        let reranked = vec![RerankResult {
            index: 0,
            score: 0.92,
            text: fused[0].text.clone(),
        }];

        let sources = build_sources(&reranked, &fused);
        assert_eq!(sources[0].title, "Dryer Manual");
        assert_eq!(sources[0].url.as_deref(), Some("/kb/dryer-manual.md"));
        assert_eq!(sources[0].score, 0.92);
    }

    #[test]
    fn unmatched_rerank_text_falls_back_to_generic_title() {
        let sources = build_sources(
            &[RerankResult {
                index: 0,
                score: 0.5,
                text: "text that matches nothing".into(),
            }],
            &[],
        );
        assert_eq!(sources[0].title, "Document");
        assert!(sources[0].url.is_none());
    }

    #[test]
    fn topic_candidates_dedupe_in_rank_order() {
        let reranked = vec![
            RerankResult {
                index: 0,
                score: 0.7,
                text: "Lint trap\nbody".into(),
            },
            RerankResult {
                index: 1,
                score: 0.69,
                text: "Lint trap\nother body".into(),
            },
            RerankResult {
                index: 2,
                score: 0.68,
                text: "Door latch\nbody".into(),
            },
        ];
        assert_eq!(topic_candidates(&reranked), vec!["Lint trap", "Door latch"]);
    }
}
