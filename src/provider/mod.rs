//! Capability providers - the pluggable units of external work.
//!
//! The engine never talks to a language model, a search API or a calculator
//! directly. Every suspension point goes through [`CapabilityProvider::invoke`],
//! and the only thing the engine needs back is a typed output or a
//! [`ProviderFailure`] carrying the transient/permanent distinction.
//!
//! # Dispatch
//! Providers are selected through a closed [`ProviderSet`]:
//! - `reasoning` handles `classify`, `plan` and `verify`
//! - `generate`, `search`, `compute` execute atomic nodes, chosen by [`ProviderHint`]

mod error;
pub mod scripted;

pub use error::{backoff_delay, classify_http_status, FailureKind, ProviderFailure};
pub use scripted::ScriptedProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::NodeId;

/// Kind of request sent to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Classify,
    Plan,
    Generate,
    Search,
    Compute,
    Verify,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::Classify => "classify",
            RequestKind::Plan => "plan",
            RequestKind::Generate => "generate",
            RequestKind::Search => "search",
            RequestKind::Compute => "compute",
            RequestKind::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Which executor capability an atomic node needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHint {
    #[default]
    Generate,
    Search,
    Compute,
}

impl ProviderHint {
    /// The request kind used to execute a node with this hint.
    pub fn request_kind(&self) -> RequestKind {
        match self {
            Self::Generate => RequestKind::Generate,
            Self::Search => RequestKind::Search,
            Self::Compute => RequestKind::Compute,
        }
    }

    /// Lenient parse used on provider output ("web_search", "Calculator", ...).
    pub fn parse_lenient(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        if lower.contains("search") || lower.contains("research") {
            Some(Self::Search)
        } else if lower.contains("comput") || lower.contains("calc") || lower.contains("math") {
            Some(Self::Compute)
        } else if lower.contains("generat") || lower.contains("writ") || lower.contains("text") {
            Some(Self::Generate)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ProviderHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.request_kind().fmt(f)
    }
}

/// Context describing which node a request is made for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub node_id: NodeId,
    pub depth: u32,
    pub attempt: u32,
    /// Goals of the ancestors, outermost first (run context lines come before the root goal)
    pub ancestors: Vec<String>,
}

/// A single request to a capability provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub kind: RequestKind,
    pub payload: serde_json::Value,
    pub context: RequestContext,
}

impl ProviderRequest {
    /// The goal carried in the payload, if any.
    pub fn goal(&self) -> Option<&str> {
        self.payload.get("goal").and_then(|g| g.as_str())
    }
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Primary textual content
    pub content: String,
    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProviderOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            content: value.to_string(),
            data: Some(value),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A pluggable provider of one or more capabilities.
///
/// # Invariants
/// - `invoke()` never panics; failures are returned as `Err`
/// - `Err(f)` with `f.is_transient()` means a retry may succeed
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Perform one unit of work.
    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderFailure>;
}

/// Shared reference to a provider.
pub type ProviderRef = Arc<dyn CapabilityProvider>;

/// The closed set of providers available to a run.
#[derive(Clone)]
pub struct ProviderSet {
    reasoning: ProviderRef,
    generate: ProviderRef,
    search: Option<ProviderRef>,
    compute: Option<ProviderRef>,
}

impl ProviderSet {
    /// Create a provider set from a reasoning provider and a text generator.
    pub fn new(reasoning: ProviderRef, generate: ProviderRef) -> Self {
        Self {
            reasoning,
            generate,
            search: None,
            compute: None,
        }
    }

    /// Use one provider for every capability.
    pub fn uniform(provider: ProviderRef) -> Self {
        Self {
            reasoning: Arc::clone(&provider),
            generate: Arc::clone(&provider),
            search: Some(Arc::clone(&provider)),
            compute: Some(provider),
        }
    }

    pub fn with_search(mut self, provider: ProviderRef) -> Self {
        self.search = Some(provider);
        self
    }

    pub fn with_compute(mut self, provider: ProviderRef) -> Self {
        self.compute = Some(provider);
        self
    }

    /// Resolve the provider responsible for a request kind.
    pub fn for_kind(&self, kind: RequestKind) -> Option<ProviderRef> {
        match kind {
            RequestKind::Classify | RequestKind::Plan | RequestKind::Verify => {
                Some(Arc::clone(&self.reasoning))
            }
            RequestKind::Generate => Some(Arc::clone(&self.generate)),
            RequestKind::Search => self.search.clone(),
            RequestKind::Compute => self.compute.clone(),
        }
    }
}
