//! Configuration loading.
//!
//! The config file is a property file with dotted keys: server-wide options
//! under `main.*`, one section per source under `sources.<name>.*`. Loading
//! returns a validated catalog; every error here is fatal at boot.

use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use hashbrown::HashMap;
use url::Url;

// Sane defaults
pub const SERVER_ID: &str = "Flamecast 0.1.0";
const DEFAULT_BIND: &str = ":8000";
const DEFAULT_LOG_FILE: &str = "/var/log/flamecast.log";
const DEFAULT_LOG_LEVEL: &str = "ERROR";
const DEFAULT_SOURCE_USER: &str = "source";
const DEFAULT_SOURCE_PASSWORD: &str = "?";
const DEFAULT_BITRATE: u32 = 96;

/// A parsed dotted-key property file
pub struct Properties {
    map: HashMap<String, String>,
}

impl Properties {
    pub fn load(path: &str) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, val)) = line.split_once('=') {
                map.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        Properties { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn key_exists(&self, prefix: &str) -> bool {
        let nested = format!("{}.", prefix);
        self.map
            .keys()
            .any(|key| key == prefix || key.starts_with(&nested))
    }

    /// Distinct immediate sub-segments under `prefix`, sorted
    pub fn subkeys(&self, prefix: &str) -> Vec<String> {
        let nested = format!("{}.", prefix);
        let mut names: Vec<String> = self
            .map
            .keys()
            .filter_map(|key| key.strip_prefix(&nested))
            .filter_map(|rest| rest.split('.').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceType {
    Push,
    Pull,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Push => "push",
            SourceType::Pull => "pull",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastAuthType {
    None,
    Token,
}

/// Stream descriptors served to listeners; the boot-time defaults live here,
/// the runtime-mutable copy lives on the source itself
#[derive(Clone, Debug)]
pub struct StreamDescription {
    pub name: String,
    pub description: String,
    pub genre: String,
    pub site: String,
    pub bitrate: u32,
    pub public: bool,
    pub audio_info: String,
}

#[derive(Debug)]
pub struct SourceConfig {
    pub name: String,
    pub path: String,
    pub fallback_path: Option<String>,
    pub kind: SourceType,
    /// `base64(user:password)`, compared verbatim against Basic credentials
    pub auth_token: String,
    pub pull_url: Option<Url>,
    pub stream: StreamDescription,
    pub broadcast_auth: BroadcastAuthType,
    pub token_check_url: Option<Url>,
    pub notify_enter_url: Option<Url>,
    pub notify_leave_url: Option<Url>,
}

pub struct Config {
    pub bind: String,
    pub log_file: String,
    pub log_level: tracing::Level,
    pub admin: String,
    /// Catalog keyed by mount path
    pub sources: HashMap<String, Arc<SourceConfig>>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        Self::from_properties(&Properties::load(path)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::from_properties(&Properties::parse(text))
    }

    /// Host part listeners reach this server on, used in the stats snapshot
    pub fn host(&self) -> String {
        match self.bind.rsplit_once(':') {
            Some((host, _)) if !host.is_empty() => host.to_string(),
            _ => "localhost".to_string(),
        }
    }

    fn from_properties(props: &Properties) -> Result<Self> {
        let bind = props.get("main.bind").unwrap_or(DEFAULT_BIND).to_string();
        let log_file = props
            .get("main.log.file")
            .unwrap_or(DEFAULT_LOG_FILE)
            .to_string();
        let log_level = parse_log_level(props.get("main.log.level").unwrap_or(DEFAULT_LOG_LEVEL))?;
        let admin = props.get("main.admin").unwrap_or_default().to_string();

        if !props.key_exists("sources") {
            return Err(anyhow::Error::msg("no [sources.*] sections found"));
        }

        let mut configs = Vec::new();
        for name in props.subkeys("sources") {
            configs.push(load_source(props, &name)?);
        }

        // Second pass: fallback names resolve to paths within the catalog
        let paths: HashMap<String, String> = configs
            .iter()
            .map(|scfg| (scfg.name.clone(), scfg.path.clone()))
            .collect();
        for scfg in &mut configs {
            let key = format!("sources.{}.source.fallback", scfg.name);
            if let Some(fallback_name) = props.get(&key) {
                match paths.get(fallback_name) {
                    Some(path) => scfg.fallback_path = Some(path.clone()),
                    None => {
                        return Err(anyhow::Error::msg(format!(
                            "invalid fallback '{}' for source {}",
                            fallback_name, scfg.name
                        )))
                    }
                }
            }
        }

        let mut sources = HashMap::new();
        for scfg in configs {
            sources.insert(scfg.path.clone(), Arc::new(scfg));
        }

        Ok(Config {
            bind,
            log_file,
            log_level,
            admin,
            sources,
        })
    }
}

fn load_source(props: &Properties, name: &str) -> Result<SourceConfig> {
    let prefix = format!("sources.{}.", name);
    let get = |key: &str| props.get(&format!("{}{}", prefix, key));

    let path = match get("source.path") {
        Some(path) => path.to_string(),
        None => format!("/{}", name),
    };

    let kind = match get("source.type") {
        Some(kind) => match kind.to_uppercase().as_str() {
            "PUSH" => SourceType::Push,
            "PULL" => SourceType::Pull,
            other => {
                return Err(anyhow::Error::msg(format!(
                    "invalid source type {} for source {}, valid types are \"push\", \"pull\"",
                    other, name
                )))
            }
        },
        None => return Err(anyhow::Error::msg(format!("no source.type for source {}", name))),
    };

    let user = get("source.auth.user").unwrap_or(DEFAULT_SOURCE_USER);
    let password = get("source.auth.password").unwrap_or(DEFAULT_SOURCE_PASSWORD);
    let auth_token =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));

    let pull_url = match kind {
        SourceType::Pull => match get("source.url") {
            Some(raw) => Some(parse_url(raw, "source.url", name)?),
            None => {
                return Err(anyhow::Error::msg(format!(
                    "no source.url for PULL-type source {}",
                    name
                )))
            }
        },
        SourceType::Push => None,
    };

    let broadcast_auth = match get("broadcast.auth.type").unwrap_or("NONE").to_uppercase().as_str()
    {
        "NONE" => BroadcastAuthType::None,
        "TOKEN" => BroadcastAuthType::Token,
        other => {
            return Err(anyhow::Error::msg(format!(
                "invalid broadcast.auth.type {} for source {}, valid types are \"none\", \"token\"",
                other, name
            )))
        }
    };

    let token_check_url = match broadcast_auth {
        BroadcastAuthType::Token => match get("broadcast.auth.token_check_url") {
            Some(raw) => Some(parse_url(raw, "broadcast.auth.token_check_url", name)?),
            None => {
                return Err(anyhow::Error::msg(format!(
                    "no broadcast.auth.token_check_url (while broadcast.auth.type is TOKEN) for source {}",
                    name
                )))
            }
        },
        BroadcastAuthType::None => None,
    };

    let notify_enter_url = match get("broadcast.notify.enter") {
        Some(raw) => Some(parse_url(raw, "broadcast.notify.enter", name)?),
        None => None,
    };
    let notify_leave_url = match get("broadcast.notify.leave") {
        Some(raw) => Some(parse_url(raw, "broadcast.notify.leave", name)?),
        None => None,
    };

    let bitrate = match get("source.bitrate") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| anyhow::Error::msg(format!("invalid source.bitrate for source {}", name)))?,
        None => DEFAULT_BITRATE,
    };

    let stream = StreamDescription {
        name: get("source.name").unwrap_or_default().to_string(),
        description: get("source.description").unwrap_or_default().to_string(),
        genre: get("source.genre").unwrap_or_default().to_string(),
        site: get("source.site").unwrap_or_default().to_string(),
        bitrate,
        public: get("source.public").map(parse_bool).unwrap_or(false),
        audio_info: match get("source.audio_info") {
            Some(info) => info.to_string(),
            None => format!("br={}", bitrate),
        },
    };

    Ok(SourceConfig {
        name: name.to_string(),
        path,
        fallback_path: None,
        kind,
        auth_token,
        pull_url,
        stream,
        broadcast_auth,
        token_check_url,
        notify_enter_url,
        notify_leave_url,
    })
}

fn parse_url(raw: &str, key: &str, source: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| {
        anyhow::Error::msg(format!("invalid {} for source {}: {}", key, source, e))
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_log_level(raw: &str) -> Result<tracing::Level> {
    match raw.to_uppercase().as_str() {
        "DEBUG" => Ok(tracing::Level::DEBUG),
        "INFO" | "NOTICE" => Ok(tracing::Level::INFO),
        "WARNING" => Ok(tracing::Level::WARN),
        "ERROR" | "CRITICAL" => Ok(tracing::Level::ERROR),
        other => Err(anyhow::Error::msg(format!("invalid log level: {}", other))),
    }
}
