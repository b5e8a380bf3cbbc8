pub mod text;

// Re-export the chunking entry points for external use
pub use text::{Chunk, Document, WindowChunker, normalize_text, split_windows};
