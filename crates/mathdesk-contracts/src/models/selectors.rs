use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Set when the requested model was not used.
    pub fallback_reason: Option<String>,
}

/// Picks a chat model the active completion provider can actually serve.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(ModelRegistry::new(None))
    }
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        provider: &str,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        let fallback_reason = match requested {
            None => None,
            Some(name) => match self.registry.resolve(name) {
                Some(model) if model.provider != provider => Some(format!(
                    "Model '{name}' is served by '{}', not '{provider}'.",
                    model.provider
                )),
                Some(model) if !model.supports(capability) => {
                    Some(format!("Model '{name}' does not support '{capability}'."))
                }
                Some(model) => {
                    return Ok(ModelSelection {
                        model,
                        requested: Some(name.to_string()),
                        fallback_reason: None,
                    });
                }
                None => Some(format!("Unknown model '{name}'.")),
            },
        };

        let Some(model) = self.registry.candidates(provider, capability).next().cloned() else {
            return Err(format!(
                "No '{capability}' models available for provider '{provider}'."
            ));
        };
        Ok(ModelSelection {
            fallback_reason: fallback_reason
                .map(|reason| format!("{reason} Using '{}'.", model.name)),
            model,
            requested: requested.map(str::to_string),
        })
    }
}
