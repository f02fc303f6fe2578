//! Provider Backends
//!
//! Abstracted access to upstream AI vendors through a common trait.
//!
//! # Available Clients
//!
//! - **HttpProviderClient**: OpenAI-compatible chat completions over reqwest
//! - **ScriptedProvider** (`routing::test_utils`): in-process scripted answers
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::backend::{HttpProviderClient, ProviderClient};
//!
//! let client = HttpProviderClient::from_catalog(&catalog)?;
//! let reply = client.invoke(ProviderId::Groq, &request.normalized(), timeout).await?;
//! ```

mod http;
mod traits;

pub use http::{classify_status, HttpProviderClient, ProviderEndpoint};
pub use traits::{ProviderClient, ProviderError, ProviderReply, ProviderRequest};
