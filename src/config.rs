use anyhow::Result;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Settings for the chat completion endpoint used by the prompt generator.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_key: String,
    pub model: String,
    pub base_url: String,
}

impl Config {
    /// Reads `OPENAI_API_KEY`, `OPENAI_MODEL` and `OPENAI_BASE_URL`, after
    /// loading a `.env` file from the working directory if one exists.
    pub fn from_env() -> Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "ignoring unreadable .env file");
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let openai_key = lookup("OPENAI_API_KEY").unwrap_or_default();
        if openai_key.trim().is_empty() {
            anyhow::bail!("OPENAI_API_KEY not found. Set it in the environment or a .env file.");
        }

        let model = lookup("OPENAI_MODEL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = lookup("OPENAI_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            openai_key: openai_key.trim().to_string(),
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}
