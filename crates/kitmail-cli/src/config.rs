//! `kitmail.toml` loading: working directory first, then the XDG config dir.

use std::path::PathBuf;

use kitmail_core::{Account, TlsMode};

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("kitmail.toml"),
        xdg_config_dir().join("kitmail").join("kitmail.toml"),
    ]
}

pub fn load_config_text() -> Option<String> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

pub fn load_accounts() -> Vec<Account> {
    match load_config_text() {
        Some(text) => parse_accounts(&text),
        None => Vec::new(),
    }
}

pub fn parse_accounts(content: &str) -> Vec<Account> {
    let value: toml::Value = match toml::from_str(content) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Some(accounts) = value.get("accounts").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    accounts
        .iter()
        .enumerate()
        .filter_map(|(idx, acct)| parse_account_table(acct, idx))
        .collect()
}

fn parse_account_table(value: &toml::Value, index: usize) -> Option<Account> {
    let id = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("account-{}", index + 1));
    Some(Account {
        id,
        host: value.get("host")?.as_str()?.to_string(),
        port: value
            .get("port")
            .and_then(|v| v.as_integer())
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(993),
        tls: parse_tls(value.get("tls").and_then(|v| v.as_str())),
        username: value.get("username")?.as_str()?.to_string(),
        password: value.get("password")?.as_str()?.to_string(),
        fetch_limit: value
            .get("fetch_limit")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as usize)
            .unwrap_or(200),
        timeout_secs: value
            .get("timeout_secs")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(30),
        skip_tls_verify: value
            .get("skip_tls_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

fn parse_tls(raw: Option<&str>) -> TlsMode {
    match raw {
        Some("starttls") => TlsMode::StartTls,
        Some("plain") => TlsMode::Plain,
        _ => TlsMode::Wrapped,
    }
}
