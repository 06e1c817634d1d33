//! Credential file storage (`$XDG_CONFIG_HOME/evalbot/credentials.json`).
//!
//! CLI flags and environment variables take precedence; the file only fills
//! in what they leave unset.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotCredentials {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

impl BotCredentials {
    fn normalize(&mut self) {
        for field in [&mut self.identifier, &mut self.password, &mut self.service] {
            *field = field.as_ref().map(|s| s.trim().to_string());
            if matches!(field.as_deref(), Some(s) if s.is_empty()) {
                *field = None;
            }
        }
    }

    /// Fills unset fields from `other`.
    pub fn merge(mut self, other: BotCredentials) -> Self {
        self.identifier = self.identifier.or(other.identifier);
        self.password = self.password.or(other.password);
        self.service = self.service.or(other.service);
        self
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn credentials_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("evalbot").join("credentials.json"))
}

pub fn load_credentials() -> anyhow::Result<Option<BotCredentials>> {
    let path = credentials_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut creds: BotCredentials = serde_json::from_str(&raw)?;
    creds.normalize();
    Ok(Some(creds))
}

pub fn save_credentials(creds: &BotCredentials) -> anyhow::Result<()> {
    let path = credentials_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid credentials path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut creds = creds.clone();
    creds.normalize();

    let json = serde_json::to_string_pretty(&creds)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_self() {
        let primary = BotCredentials {
            identifier: Some("bot.example.com".to_string()),
            password: None,
            service: None,
        };
        let fallback = BotCredentials {
            identifier: Some("other.example.com".to_string()),
            password: Some("secret".to_string()),
            service: Some("https://bsky.social".to_string()),
        };

        let merged = primary.merge(fallback);
        assert_eq!(merged.identifier.as_deref(), Some("bot.example.com"));
        assert_eq!(merged.password.as_deref(), Some("secret"));
        assert_eq!(merged.service.as_deref(), Some("https://bsky.social"));
    }

    #[test]
    fn normalize_drops_blank_fields() {
        let mut creds = BotCredentials {
            identifier: Some("  bot.example.com ".to_string()),
            password: Some("   ".to_string()),
            service: None,
        };
        creds.normalize();
        assert_eq!(creds.identifier.as_deref(), Some("bot.example.com"));
        assert_eq!(creds.password, None);
    }
}
