use indexmap::IndexMap;

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

    /// Looks `name` up directly or as a dated snapshot of a known model
    /// (`gpt-4o-2024-11-20` resolves through `gpt-4o`). Snapshots keep their
    /// own name.
    pub fn resolve(&self, name: &str) -> Option<ModelSpec> {
        let name = name.trim();
        if let Some(model) = self.get(name) {
            return Some(model.clone());
        }
        let base = snapshot_base(name)?;
        self.get(base).map(|model| ModelSpec {
            name: name.to_string(),
            ..model.clone()
        })
    }

    /// Models served by `provider` that support `capability`, in registry order.
    pub fn candidates<'a>(
        &'a self,
        provider: &'a str,
        capability: &'a str,
    ) -> impl Iterator<Item = &'a ModelSpec> + 'a {
        self.models
            .values()
            .filter(move |model| model.provider == provider && model.supports(capability))
    }
}

fn snapshot_base(name: &str) -> Option<&str> {
    // `-YYYY-MM-DD`
    let split = name.len().checked_sub(11)?;
    let base = name.get(..split)?;
    let date = name.get(split..)?.strip_prefix('-')?;
    let dated = date.bytes().enumerate().all(|(index, byte)| match index {
        4 | 7 => byte == b'-',
        _ => byte.is_ascii_digit(),
    });
    (dated && !base.is_empty()).then_some(base)
}

// First vision-capable entry per provider is that provider's default.
fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
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

    insert("gpt-4o", "openai", &["text", "vision"], Some(128000));
    insert("gpt-4o-mini", "openai", &["text", "vision"], Some(128000));
    insert("gpt-4.1", "openai", &["text", "vision"], Some(1047576));
    insert("gpt-4.1-mini", "openai", &["text", "vision"], Some(1047576));
    insert("gpt-4-turbo", "openai", &["text", "vision"], Some(128000));
    insert("gpt-3.5-turbo", "openai", &["text"], Some(16385));
    insert("dryrun-chat-1", "dryrun", &["text", "vision"], Some(8192));

    map
}
