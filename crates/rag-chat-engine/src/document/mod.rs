pub mod chunker;
pub mod cleaner;
pub mod loader;
pub mod metadata;
pub mod safety;

pub use chunker::{Chunk, TextChunker};
pub use cleaner::TextCleaner;
pub use loader::{LoadedDocument, SourceLoader};
pub use metadata::MetadataExtractor;
