use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "parley";
pub const EMAIL_ENV: &str = "PARLEY_EMAIL";
pub const PASSWORD_ENV: &str = "PARLEY_PASSWORD";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Credentials {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(email: &str, password: &str) -> Self {
        Credentials {
            email: email.to_string(),
            password: Some(BASE64.encode(password)),
        }
    }

    pub fn get_password(&self) -> Option<String> {
        self.password.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }

    /// Credentials from PARLEY_EMAIL / PARLEY_PASSWORD, when both are set
    pub fn from_env() -> Option<Self> {
        let email = std::env::var(EMAIL_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        if email.is_empty() || password.is_empty() {
            return None;
        }
        Some(Credentials::new(&email, &password))
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);
    ensure_dir(&config_dir)?;
    Ok(config_dir)
}

/// Directory holding the database and the log file
pub fn get_data_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    let data_dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join(APP_DIR),
    };
    ensure_dir(&data_dir)?;
    Ok(data_dir)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn credentials_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("credentials.json"))
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    save_credentials_to(&credentials_path()?, credentials)
}

pub fn save_credentials_to(path: &Path, credentials: &Credentials) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;
    info!("Credentials saved for {}", credentials.email);
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    load_credentials_from(&credentials_path()?)
}

pub fn load_credentials_from(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.email, path.display());
    Ok(Some(credentials))
}

/// Forget saved credentials, e.g. after they were rejected
pub fn clear_credentials() -> Result<()> {
    let path = credentials_path()?;
    if path.exists() {
        fs::remove_file(&path)?;
        info!("Removed saved credentials at {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_encoded_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let credentials = Credentials::new("alice@example.com", "hunter22");

        save_credentials_to(&path, &credentials).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hunter22"));

        let loaded = load_credentials_from(&path).unwrap().unwrap();
        assert_eq!(loaded, credentials);
        assert_eq!(loaded.get_password().as_deref(), Some("hunter22"));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_credentials_from(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_data_dir_override_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let data_dir = get_data_dir(Some(&nested)).unwrap();
        assert_eq!(data_dir, nested);
        assert!(nested.is_dir());
    }
}
