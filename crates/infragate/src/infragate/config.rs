use std::{
    collections::{BTreeMap, HashMap},
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::Engine;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::infragate::{
    backend::Backend,
    events::WebhookTarget,
    gateway::{GatewayOptions, IngressOptions},
    net,
    protocol::DEFAULT_MAX_HANDSHAKE_BYTES,
    status::{PlayerSample, ServerStatus},
};

pub const CONFIG_ENV: &str = "INFRAGATE_CONFIG";
pub const DEFAULT_LISTEN_ADDR: &str = ":25565";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps INFRAGATE_CONFIG into the flag already; this covers callers that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV)
        && !p.is_empty()
    {
        let p = normalize_explicit_path(Path::new(&p))?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Env,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("infragate.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["infragate.toml", "infragate.yaml", "infragate.yml"];
    for c in candidates {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no infragate.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/infragate/infragate.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "infragate", "infragate")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("infragate.toml"))
    }
}

/// Write the commented default config if `path` does not exist. Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub admin_addr: String,
    pub gateway: GatewayOptions,
    /// Sorted by id.
    pub servers: Vec<Backend>,
    pub webhooks: Vec<WebhookTarget>,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    gateway: Option<FileGateway>,

    #[serde(default)]
    servers: BTreeMap<String, FileServer>,

    #[serde(default)]
    webhooks: BTreeMap<String, FileWebhook>,

    logging: Option<FileLogging>,

    reload: Option<FileReload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileGateway {
    #[serde(default)]
    receive_proxy_protocol: bool,
    #[serde(default)]
    receive_real_ip: bool,
    client_timeout_ms: Option<u64>,
    max_handshake_bytes: Option<usize>,
    unknown_host_disconnect: Option<String>,
    #[serde(default)]
    listeners: Vec<FileListener>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileListener {
    listen_addr: String,
    receive_proxy_protocol: Option<bool>,
    receive_real_ip: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    domains: StringOrVec,
    listen_addr: Option<String>,
    address: String,
    proxy_bind: Option<String>,
    dial_timeout_ms: Option<u64>,
    #[serde(default)]
    send_proxy_protocol: bool,
    #[serde(default)]
    send_real_ip: bool,
    disconnect_message: Option<String>,
    online_status: Option<FileStatus>,
    offline_status: Option<FileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatus {
    #[serde(default)]
    version_name: String,
    #[serde(default)]
    protocol_number: i32,
    #[serde(default)]
    max_players: i32,
    #[serde(default)]
    players_online: i32,
    #[serde(default)]
    player_sample: Vec<FilePlayerSample>,
    icon_path: Option<String>,
    #[serde(default)]
    motd: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePlayerSample {
    name: String,
    uuid: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileWebhook {
    url: String,
    events: StringOrVec,
    client_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    enabled: Option<bool>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let base_dir = config_path.parent().unwrap_or(Path::new("."));

        let fg = fc.gateway.unwrap_or_default();
        let defaults = IngressOptions {
            receive_proxy_protocol: fg.receive_proxy_protocol,
            receive_real_ip: fg.receive_real_ip,
        };
        let mut listeners = HashMap::new();
        for l in fg.listeners {
            let addr = l.listen_addr.trim().to_string();
            if addr.is_empty() {
                anyhow::bail!("config: gateway.listeners entry with empty listen_addr");
            }
            listeners.insert(
                addr,
                IngressOptions {
                    receive_proxy_protocol: l
                        .receive_proxy_protocol
                        .unwrap_or(defaults.receive_proxy_protocol),
                    receive_real_ip: l.receive_real_ip.unwrap_or(defaults.receive_real_ip),
                },
            );
        }
        let gateway = GatewayOptions {
            defaults,
            listeners,
            client_timeout: Duration::from_millis(fg.client_timeout_ms.unwrap_or(5000)),
            max_handshake_bytes: fg
                .max_handshake_bytes
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_HANDSHAKE_BYTES),
            unknown_host_disconnect: non_empty(fg.unknown_host_disconnect),
        };

        let mut servers = Vec::with_capacity(fc.servers.len());
        for (id, s) in fc.servers {
            let backend = server_from_file(&id, s, base_dir)
                .with_context(|| format!("config: servers.{id}"))?;
            servers.push(backend);
        }

        let mut webhooks = Vec::with_capacity(fc.webhooks.len());
        for (id, w) in fc.webhooks {
            let url = w.url.trim().to_string();
            if url.is_empty() {
                anyhow::bail!("config: webhooks.{id}: missing url");
            }
            let events: Vec<String> = w
                .events
                .into_vec()
                .into_iter()
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
            webhooks.push(WebhookTarget {
                id,
                url,
                events,
                timeout: Duration::from_millis(w.client_timeout_ms.unwrap_or(5000)),
            });
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(v) = non_empty(l.level) {
                logging.level = v;
            }
            if let Some(v) = non_empty(l.format) {
                logging.format = v.to_ascii_lowercase();
            }
            if let Some(v) = non_empty(l.output) {
                logging.output = v;
            }
            logging.add_source = l.add_source;
        }

        let reload = ReloadConfig {
            enabled: fc.reload.as_ref().and_then(|r| r.enabled).unwrap_or(true),
            poll_interval: Duration::from_millis(
                fc.reload
                    .as_ref()
                    .and_then(|r| r.poll_interval_ms)
                    .filter(|ms| *ms > 0)
                    .unwrap_or(1000),
            ),
        };

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            gateway,
            servers,
            webhooks,
            logging,
            reload,
        })
    }
}

fn server_from_file(id: &str, s: FileServer, base_dir: &Path) -> anyhow::Result<Backend> {
    let address = s.address.trim();
    if address.is_empty() {
        anyhow::bail!("missing address");
    }
    let listen_addr = non_empty(s.listen_addr).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

    let mut b = Backend::new(
        id,
        s.domains.into_vec(),
        listen_addr,
        net::with_default_port(address),
    );
    if let Some(ms) = s.dial_timeout_ms {
        b.dial_timeout = Duration::from_millis(ms);
    }
    b.proxy_bind = match non_empty(s.proxy_bind) {
        Some(ip) => Some(
            ip.parse::<IpAddr>()
                .with_context(|| format!("invalid proxy_bind {ip:?}"))?,
        ),
        None => None,
    };
    b.send_proxy_protocol = s.send_proxy_protocol;
    b.send_real_ip = s.send_real_ip;
    b.disconnect_message = non_empty(s.disconnect_message);
    b.online_status = s
        .online_status
        .map(|st| status_from_file(st, base_dir))
        .transpose()
        .context("online_status")?;
    b.offline_status = s
        .offline_status
        .map(|st| status_from_file(st, base_dir))
        .transpose()
        .context("offline_status")?;

    b.validate()?;
    Ok(b)
}

fn status_from_file(st: FileStatus, base_dir: &Path) -> anyhow::Result<ServerStatus> {
    let icon = match non_empty(st.icon_path) {
        Some(p) => Some(load_icon(&base_dir.join(p))?),
        None => None,
    };
    Ok(ServerStatus {
        version_name: st.version_name,
        protocol_number: st.protocol_number,
        max_players: st.max_players,
        players_online: st.players_online,
        player_sample: st
            .player_sample
            .into_iter()
            .map(|p| PlayerSample {
                name: p.name,
                id: p.uuid,
            })
            .collect(),
        icon,
        motd: st.motd,
    })
}

/// Read a PNG and encode it as a status favicon data URI.
fn load_icon(path: &Path) -> anyhow::Result<String> {
    let data = fs::read(path).with_context(|| format!("read icon {}", path.display()))?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(data)
    ))
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# infragate configuration (auto-generated)
#
# This file was created because infragate could not find a configuration file at
# the resolved config path. Edit the example server below and the gateway picks
# up the change while running.

# Admin HTTP server (/health, /metrics, /conns, /backends, /listeners, /reload).
# Leave empty to disable.
admin_addr = ":8080"

[gateway]
receive_proxy_protocol = false
receive_real_ip = false
client_timeout_ms = 5000
# unknown_host_disconnect = "Unknown server address."

# Per listen address overrides:
# [[gateway.listeners]]
# listen_addr = ":25566"
# receive_proxy_protocol = true

[servers.example]
domains = ["mc.example.com"]
listen_addr = ":25565"
address = "127.0.0.1:25566"
dial_timeout_ms = 1000
send_proxy_protocol = false
send_real_ip = false
disconnect_message = "Sorry {{username}}, the server is offline."

[servers.example.offline_status]
version_name = "Infragate"
max_players = 20
motd = "Server is offline."

# [webhooks.audit]
# url = "http://127.0.0.1:9000/events"
# events = ["player_join", "player_leave"]

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval_ms = 1000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# infragate configuration (auto-generated)
#
# This file was created because infragate could not find a configuration file at
# the resolved config path. Edit the example server below and the gateway picks
# up the change while running.

# Admin HTTP server (/health, /metrics, /conns, /backends, /listeners, /reload).
# Leave empty to disable.
admin_addr: ":8080"

gateway:
  receive_proxy_protocol: false
  receive_real_ip: false
  client_timeout_ms: 5000
  # unknown_host_disconnect: "Unknown server address."
  # listeners:
  #   - listen_addr: ":25566"
  #     receive_proxy_protocol: true

servers:
  example:
    domains: ["mc.example.com"]
    listen_addr: ":25565"
    address: "127.0.0.1:25566"
    dial_timeout_ms: 1000
    send_proxy_protocol: false
    send_real_ip: false
    disconnect_message: "Sorry {{username}}, the server is offline."
    offline_status:
      version_name: "Infragate"
      max_players: 20
      motd: "Server is offline."

# webhooks:
#   audit:
#     url: "http://127.0.0.1:9000/events"
#     events: ["player_join", "player_leave"]

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval_ms: 1000
"#;
