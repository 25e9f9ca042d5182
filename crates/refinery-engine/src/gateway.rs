use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::GatewayError;

/// Text delivered in place of a reply that carried no text parts.
pub const NO_CONTENT_TEXT: &str =
    "The model processed the request but returned no text. Check whether a safety filter blocked the response.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    /// The call succeeded but produced no text; `reason` carries the block or finish reason when known.
    Empty { reason: Option<String> },
}

impl ModelReply {
    pub fn from_text(text: String, reason: Option<String>) -> Self {
        if text.trim().is_empty() {
            return Self::Empty { reason };
        }
        Self::Text(text)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Empty { .. } => None,
        }
    }

    pub fn into_text_or_placeholder(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Empty { .. } => NO_CONTENT_TEXT.to_string(),
        }
    }

    pub fn empty_reason(&self) -> Option<&str> {
        match self {
            Self::Empty { reason } => reason.as_deref(),
            Self::Text(_) => None,
        }
    }
}

/// An image ready to be attached to a model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime: String,
    pub data_base64: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

pub trait ModelGateway: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn analyze(&self, prompt: &str, images: &[InlineImage]) -> Result<ModelReply, GatewayError>;

    /// Same contract as [`analyze`](Self::analyze); fragments are handed to
    /// `on_fragment` in arrival order and the reply is their concatenation.
    fn analyze_streamed(
        &self,
        prompt: &str,
        images: &[InlineImage],
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<ModelReply, GatewayError> {
        let reply = self.analyze(prompt, images)?;
        if let Some(text) = reply.text() {
            on_fragment(text);
        }
        Ok(reply)
    }
}

#[derive(Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, Arc<dyn ModelGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ModelGateway + 'static>(&mut self, gateway: G) {
        self.gateways
            .insert(gateway.name().to_string(), Arc::new(gateway));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelGateway>> {
        self.gateways.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.gateways.keys().cloned().collect()
    }
}
