//! Docker config credential parsing.
//!
//! Pull secrets hold a docker `config.json` document; each entry in its
//! `auths` map yields a registry credential. Credentials may carry an
//! explicit username/password pair or a base64 `auth` blob.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;

use hodei_runner_core::Auth;

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

/// Parses a docker config JSON document into registry credentials.
/// Entries that decode to nothing usable are skipped.
pub fn parse_docker_config(data: &str) -> Result<Vec<Auth>, serde_json::Error> {
    let config: DockerConfig = serde_json::from_str(data)?;
    let mut out = Vec::new();
    for (address, entry) in config.auths {
        let (mut username, mut password) = (entry.username, entry.password);
        if username.is_empty() || password.is_empty() {
            if let Some((user, pass)) = decode_auth_blob(&entry.auth) {
                username = user;
                password = pass;
            }
        }
        if username.is_empty() && password.is_empty() {
            continue;
        }
        out.push(Auth {
            address,
            username,
            password,
        });
    }
    out.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(out)
}

fn decode_auth_blob(blob: &str) -> Option<(String, String)> {
    if blob.is_empty() {
        return None;
    }
    let decoded = STANDARD.decode(blob.as_bytes()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Encodes credentials as the registry auth header value used by image
/// pull requests.
pub fn header(username: &str, password: &str) -> String {
    let body = serde_json::json!({
        "username": username,
        "password": password,
    });
    STANDARD.encode(body.to_string().as_bytes())
}
