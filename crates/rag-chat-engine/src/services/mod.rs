pub mod confidence;
pub mod escalation;
pub mod events;
pub mod fusion;
pub mod ingestion;
pub mod persona;
pub mod rag_pipeline;
pub mod session;

pub use confidence::{ConfidenceReport, ConfidenceScorer, ConfidenceTier};
pub use escalation::{EscalationService, EscalationSink};
pub use events::{sentence_stream, ChatEvent, ChatEventStream, SourceRef};
pub use fusion::{reciprocal_rank_fusion, FusedHit};
pub use ingestion::IngestionPipeline;
pub use persona::PersonaService;
pub use rag_pipeline::QueryPipeline;
pub use session::{ConversationStore, SessionManager};
