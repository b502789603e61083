pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use weft_core::config::{AppConfig, ModelConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::GenerationService;

pub use providers::openai::OpenAiService;
pub use retry::RetryingService;

/// Create a generation service based on the provider name.
pub fn create_service(config: &ModelConfig) -> Result<Arc<dyn GenerationService>> {
    match config.provider.as_str() {
        "openai" | "openai-compatible" => Ok(Arc::new(OpenAiService::new(config.clone()))),
        name if providers::catalog::lookup(name).is_some() => {
            Ok(Arc::new(OpenAiService::new(config.clone())))
        }
        // Unknown providers still work if they expose an OpenAI-compatible endpoint
        _ if config.base_url.is_some() => Ok(Arc::new(OpenAiService::new(config.clone()))),
        other => Err(WeftError::UnsupportedProvider(other.to_string())),
    }
}

/// Build the service described by `config`, wrapped in retries and fallbacks
/// when either is configured.
pub fn service_from_config(config: &AppConfig) -> Result<Arc<dyn GenerationService>> {
    let primary = create_service(&config.model)?;

    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Ok(primary);
    }

    let retry_config = config.model.retry.clone().unwrap_or_default();
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|mc| Ok((mc.model_id.clone(), create_service(mc)?)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(RetryingService::new(primary, fallbacks, retry_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_service_for_known_providers() {
        let mut config = ModelConfig::new("llama3.2");
        config.provider = "ollama".into();
        assert!(create_service(&config).is_ok());
    }

    #[test]
    fn test_unknown_provider_without_base_url_is_rejected() {
        let mut config = ModelConfig::new("claude");
        config.provider = "anthropic".into();
        let err = create_service(&config).err().unwrap();
        assert!(matches!(err, WeftError::UnsupportedProvider(_)));

        config.base_url = Some("http://localhost:8080/v1/chat/completions".into());
        assert!(create_service(&config).is_ok());
    }
}
