mod upstream;

pub use upstream::{chat_completions_url, UpstreamClient};
