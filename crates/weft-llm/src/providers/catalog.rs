/// An OpenAI-compatible provider weft can reach without an explicit `base_url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProvider {
    pub name: &'static str,
    pub chat_url: &'static str,
    /// Environment variable read when the model config has no `api_key`.
    /// `None` for local servers that take no key.
    pub key_env: Option<&'static str>,
}

pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        name: "openai",
        chat_url: "https://api.openai.com/v1/chat/completions",
        key_env: Some("OPENAI_API_KEY"),
    },
    KnownProvider {
        name: "ollama",
        chat_url: "http://localhost:11434/v1/chat/completions",
        key_env: None,
    },
    KnownProvider {
        name: "groq",
        chat_url: "https://api.groq.com/openai/v1/chat/completions",
        key_env: Some("GROQ_API_KEY"),
    },
    KnownProvider {
        name: "openrouter",
        chat_url: "https://openrouter.ai/api/v1/chat/completions",
        key_env: Some("OPENROUTER_API_KEY"),
    },
];

pub fn lookup(name: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.name == name)
}

impl KnownProvider {
    pub fn needs_api_key(&self) -> bool {
        self.key_env.is_some()
    }

    /// The configured key if non-empty, else the provider's environment variable.
    pub fn resolve_api_key(&self, configured: Option<&str>) -> Option<String> {
        configured
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| self.key_env.and_then(|var| std::env::var(var).ok()))
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("groq").map(|p| p.name), Some("groq"));
        assert!(lookup("anthropic").is_none());

        let ollama = lookup("ollama").unwrap();
        assert!(!ollama.needs_api_key());
        assert!(ollama.chat_url.starts_with("http://localhost"));
    }

    #[test]
    fn test_configured_key_wins_over_environment() {
        std::env::set_var("OPENROUTER_API_KEY", "from-env");
        let openrouter = lookup("openrouter").unwrap();

        assert_eq!(
            openrouter.resolve_api_key(Some("from-config")).as_deref(),
            Some("from-config")
        );
        assert_eq!(openrouter.resolve_api_key(Some("")).as_deref(), Some("from-env"));
        assert_eq!(openrouter.resolve_api_key(None).as_deref(), Some("from-env"));

        std::env::remove_var("OPENROUTER_API_KEY");
        assert_eq!(openrouter.resolve_api_key(None), None);
        assert_eq!(lookup("ollama").unwrap().resolve_api_key(None), None);
    }
}
