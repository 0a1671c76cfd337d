//! Civitai API access: page URLs, response types and the REST client.

mod client;
mod model_ref;
mod types;

pub use client::ApiClient;
pub use model_ref::{parse_model_url, ModelRef};
pub use types::{Creator, Mirror, ModelDetails, ModelSummary, ModelVersion, VersionFile};
