pub mod decoder;
pub mod driver;
pub mod normalize;
pub mod sanitize;
pub mod splitter;

pub use decoder::{decode_line, decode_payload, ParsedEvent, PayloadShape, Skip};
pub use driver::{normalized_chunk_stream, StreamContext};
pub use normalize::{
    normalize_buffered, BufferedOutcome, CompletionAccumulator, NormalizedChunk,
    NormalizedCompletion, ResponseIdentity, StreamNormalizer, StreamPhase,
};
pub use sanitize::{sanitize, ReasoningFilter, ReasoningTags};
pub use splitter::{FrameError, FrameSplitter};
