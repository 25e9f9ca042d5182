use std::fmt;

use thiserror::Error;

/// Stage of the refinement run a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analyzing,
    Synthesizing,
    Auditing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "ANALYZING",
            Self::Synthesizing => "SYNTHESIZING",
            Self::Auditing => "AUDITING",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("no images were submitted")]
    NoInput,

    #[error("could not decode image '{filename}': {reason}")]
    Decode { filename: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no API key configured for provider '{0}'")]
    MissingApiKey(String),

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model request failed ({code}): {body}")]
    Status { code: u16, body: String },

    #[error("model returned an unreadable payload: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug)]
pub enum RefineError {
    #[error("{stage} failed: {source}")]
    Gateway {
        stage: Stage,
        #[source]
        source: GatewayError,
    },

    #[error("client disconnected during {0}")]
    Disconnected(Stage),
}

impl RefineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Gateway { stage, .. } => *stage,
            Self::Disconnected(stage) => *stage,
        }
    }
}
