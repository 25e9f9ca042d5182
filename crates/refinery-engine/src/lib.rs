pub mod config;
pub mod dryrun;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod intake;
pub mod pipeline;
pub mod prompts;
pub mod refine;

pub use config::EngineConfig;
pub use error::{GatewayError, IntakeError, RefineError, Stage};
pub use gateway::{ApiKey, InlineImage, ModelGateway, ModelReply};
pub use intake::{EvidenceSet, UploadedFile};
pub use pipeline::Pipeline;
