use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::{info, warn};

use chatsync::config::config_dir;
use chatsync::models::{Role, SessionIdentity};

const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: &str, role: Role, token: &str) -> Self {
        Credentials {
            user_id: user_id.to_string(),
            role,
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub fn identity(&self, token: &str) -> SessionIdentity {
        SessionIdentity::new(&self.user_id, self.role, token)
    }
}

/// All three of CHATSYNC_USER_ID, CHATSYNC_ROLE and CHATSYNC_TOKEN, or nothing
pub fn identity_from_env() -> Result<Option<SessionIdentity>> {
    let (Ok(user_id), Ok(role), Ok(token)) = (
        env::var("CHATSYNC_USER_ID"),
        env::var("CHATSYNC_ROLE"),
        env::var("CHATSYNC_TOKEN"),
    ) else {
        return Ok(None);
    };
    let role: Role = role.parse().map_err(|e: String| anyhow!(e))?;
    Ok(Some(SessionIdentity::new(&user_id, role, &token)))
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    save_credentials_to(&get_config_path()?, credentials)
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    load_credentials_from(&get_config_path()?)
}

fn save_credentials_to(path: &Path, credentials: &Credentials) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for {}", credentials.user_id);
    Ok(())
}

fn load_credentials_from(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    match serde_json::from_str::<Credentials>(&contents) {
        Ok(credentials) => {
            info!("Loaded credentials for {} from {}", credentials.user_id, path.display());
            Ok(Some(credentials))
        }
        Err(e) => {
            warn!("Ignoring unreadable credentials file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn get_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CREDENTIALS_FILE))
}
