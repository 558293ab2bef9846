pub mod settings;

pub use settings::{
    ConfidenceConfig, DatabaseConfig, EmbeddingConfig, EscalationConfig, IngestionConfig,
    LlmConfig, PersonaConfig, Reloadable, RerankerConfig, RetrievalConfig, Settings,
    TuningConfig, WorkerConfig,
};
