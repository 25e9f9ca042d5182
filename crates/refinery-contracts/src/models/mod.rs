mod registry;
mod selectors;

pub use registry::{
    unlisted_gemini_model, ModelRegistry, ModelSpec, CAPABILITY_STREAM, CAPABILITY_VISION,
};
pub use selectors::{ModelSelection, ModelSelector};
