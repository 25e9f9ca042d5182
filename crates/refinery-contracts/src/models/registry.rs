use indexmap::IndexMap;

pub const CAPABILITY_VISION: &str = "vision";
pub const CAPABILITY_STREAM: &str = "stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn by_provider(&self, provider: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

/// Gemini model ids change quickly; any `gemini-*` id is taken at face value.
pub fn unlisted_gemini_model(name: &str) -> Option<ModelSpec> {
    let trimmed = name.trim();
    let bare = trimmed.strip_prefix("models/").unwrap_or(trimmed);
    if !bare.starts_with("gemini-") || bare.len() <= "gemini-".len() {
        return None;
    }
    Some(ModelSpec {
        name: bare.to_string(),
        provider: "gemini".to_string(),
        capabilities: vec![
            CAPABILITY_VISION.to_string(),
            CAPABILITY_STREAM.to_string(),
        ],
        context_window: None,
    })
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert(
        "gemini-2.5-pro",
        "gemini",
        &[CAPABILITY_VISION, CAPABILITY_STREAM],
        Some(1_048_576),
    );
    insert(
        "gemini-2.5-flash",
        "gemini",
        &[CAPABILITY_VISION, CAPABILITY_STREAM],
        Some(1_048_576),
    );
    insert(
        "gemini-1.5-pro-latest",
        "gemini",
        &[CAPABILITY_VISION, CAPABILITY_STREAM],
        Some(2_097_152),
    );
    insert(
        "dryrun-vision-1",
        "dryrun",
        &[CAPABILITY_VISION, CAPABILITY_STREAM],
        Some(8192),
    );

    map
}

#[cfg(test)]
mod tests {
    use super::{unlisted_gemini_model, ModelRegistry, CAPABILITY_STREAM, CAPABILITY_VISION};

    #[test]
    fn default_registry_lists_gemini_before_dryrun() {
        let registry = ModelRegistry::new(None);
        let names: Vec<&str> = registry.list().map(|model| model.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"gemini-2.5-pro"));
        assert_eq!(names.last(), Some(&"dryrun-vision-1"));
        assert_eq!(registry.by_provider("dryrun").len(), 1);
        assert!(registry
            .by_capability(CAPABILITY_VISION)
            .iter()
            .all(|model| model.supports(CAPABILITY_STREAM)));
    }

    #[test]
    fn unlisted_gemini_ids_are_accepted_verbatim() {
        let spec = unlisted_gemini_model("models/gemini-3-pro-preview").unwrap();
        assert_eq!(spec.name, "gemini-3-pro-preview");
        assert_eq!(spec.provider, "gemini");
        assert!(unlisted_gemini_model("gemini-").is_none());
        assert!(unlisted_gemini_model("gpt-4o").is_none());
    }
}
