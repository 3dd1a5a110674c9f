//! Server configuration: TOML file + CLI overrides.

use nodegate_core::{CommandLine, GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub telnet: TelnetSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub binkp: BinkpSection,
    #[serde(default)]
    pub blocking: BlockingSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_low_node")]
    pub low_node: u32,
    #[serde(default = "default_high_node")]
    pub high_node: u32,
    #[serde(default = "default_local_node")]
    pub local_node: u32,
    #[serde(default)]
    pub launch_local_node: bool,
    #[serde(default)]
    pub launch_minimized: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            home: default_home(),
            executable: default_executable(),
            low_node: default_low_node(),
            high_node: default_high_node(),
            local_node: default_local_node(),
            launch_local_node: false,
            launch_minimized: false,
        }
    }
}

/// `[telnet]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TelnetSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_telnet_port")]
    pub port: u16,
    #[serde(default = "default_telnet_parameters")]
    pub parameters: String,
    /// Run the "press ESC twice" probe before handing off.
    #[serde(default = "default_true")]
    pub press_esc: bool,
}

impl Default for TelnetSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_telnet_port(),
            parameters: default_telnet_parameters(),
            press_esc: true,
        }
    }
}

/// `[ssh]` section. SSH clients speak first, so there is no probe.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_parameters")]
    pub parameters: String,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_ssh_port(),
            parameters: default_ssh_parameters(),
        }
    }
}

/// `[binkp]` section: the mail gateway has its own executable.
#[derive(Debug, Clone, Deserialize)]
pub struct BinkpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_binkp_port")]
    pub port: u16,
    #[serde(default = "default_binkp_executable")]
    pub executable: String,
    #[serde(default = "default_binkp_parameters")]
    pub parameters: String,
}

impl Default for BinkpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_binkp_port(),
            executable: default_binkp_executable(),
            parameters: default_binkp_parameters(),
        }
    }
}

/// `[blocking]` section: reputation lists and admission heuristics.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockingSection {
    #[serde(default = "default_true")]
    pub use_good_ip: bool,
    #[serde(default = "default_good_ip_file")]
    pub good_ip_file: String,
    #[serde(default = "default_true")]
    pub use_bad_ip: bool,
    #[serde(default = "default_bad_ip_file")]
    pub bad_ip_file: String,
    #[serde(default)]
    pub auto_ban: bool,
    #[serde(default = "default_ban_sessions")]
    pub ban_sessions: u32,
    #[serde(default = "default_ban_window")]
    pub ban_window_secs: u64,
    #[serde(default)]
    pub use_dnsrbl: bool,
    #[serde(default = "default_dnsrbl_servers")]
    pub dnsrbl_servers: Vec<String>,
    #[serde(default)]
    pub dnscc_server: Option<String>,
    #[serde(default)]
    pub banned_countries: Vec<u16>,
    /// Callers allowed in admission at once per listener; 0 is unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
}

impl Default for BlockingSection {
    fn default() -> Self {
        Self {
            use_good_ip: true,
            good_ip_file: default_good_ip_file(),
            use_bad_ip: true,
            bad_ip_file: default_bad_ip_file(),
            auto_ban: false,
            ban_sessions: default_ban_sessions(),
            ban_window_secs: default_ban_window(),
            use_dnsrbl: false,
            dnsrbl_servers: default_dnsrbl_servers(),
            dnscc_server: None,
            banned_countries: Vec::new(),
            max_concurrent: 0,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_home() -> String {
    "~/wwiv".to_string()
}
fn default_executable() -> String {
    "~/wwiv/bbs".to_string()
}
fn default_low_node() -> u32 {
    2
}
fn default_high_node() -> u32 {
    4
}
fn default_local_node() -> u32 {
    1
}
fn default_telnet_port() -> u16 {
    23
}
fn default_telnet_parameters() -> String {
    "-XT -H@H -N@N".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_ssh_parameters() -> String {
    "-XS -H@H -N@N".to_string()
}
fn default_binkp_port() -> u16 {
    24554
}
fn default_binkp_executable() -> String {
    "~/wwiv/networkb".to_string()
}
fn default_binkp_parameters() -> String {
    "-receive --handle=@H".to_string()
}
fn default_good_ip_file() -> String {
    "GOODIP.TXT".to_string()
}
fn default_bad_ip_file() -> String {
    "BADIP.TXT".to_string()
}
fn default_ban_sessions() -> u32 {
    3
}
fn default_ban_window() -> u64 {
    10
}
fn default_dnsrbl_servers() -> Vec<String> {
    vec!["zen.spamhaus.org".to_string()]
}
fn default_true() -> bool {
    true
}

/// Values the command line may force over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub home: Option<String>,
    pub executable: Option<String>,
    pub telnet_port: Option<u16>,
    pub ssh_port: Option<u16>,
    pub binkp_port: Option<u16>,
    pub enable_ssh: bool,
    pub enable_binkp: bool,
    pub launch_local_node: bool,
}

/// Inclusive range of pooled instance node numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRange {
    pub low: u32,
    pub high: u32,
}

impl NodeRange {
    pub fn contains(&self, node: u32) -> bool {
        (self.low..=self.high).contains(&node)
    }

    /// Number reserved for the gateway node when BinkP is enabled.
    pub fn gateway_number(&self) -> u32 {
        self.high + 1
    }
}

/// One listening protocol, resolved.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub enabled: bool,
    pub port: u16,
    pub command: CommandLine,
    pub probe: bool,
}

/// Reputation and admission settings, resolved.
#[derive(Debug, Clone)]
pub struct BlockingConfig {
    pub use_good_ip: bool,
    pub good_ip_file: PathBuf,
    pub use_bad_ip: bool,
    pub bad_ip_file: PathBuf,
    pub auto_ban: bool,
    pub ban_sessions: u32,
    pub ban_window_secs: u64,
    pub use_dnsrbl: bool,
    pub dnsrbl_servers: Vec<String>,
    pub dnscc_server: Option<String>,
    pub banned_countries: Vec<u16>,
    pub max_concurrent: u32,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        let section = BlockingSection::default();
        Self {
            use_good_ip: section.use_good_ip,
            good_ip_file: PathBuf::from(section.good_ip_file),
            use_bad_ip: section.use_bad_ip,
            bad_ip_file: PathBuf::from(section.bad_ip_file),
            auto_ban: section.auto_ban,
            ban_sessions: section.ban_sessions,
            ban_window_secs: section.ban_window_secs,
            use_dnsrbl: section.use_dnsrbl,
            dnsrbl_servers: section.dnsrbl_servers,
            dnscc_server: section.dnscc_server,
            banned_countries: section.banned_countries,
            max_concurrent: section.max_concurrent,
        }
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub home: PathBuf,
    pub nodes: NodeRange,
    pub local_node: u32,
    pub launch_local_node: bool,
    pub launch_minimized: bool,
    pub telnet: ProtocolConfig,
    pub ssh: ProtocolConfig,
    pub binkp: ProtocolConfig,
    pub blocking: BlockingConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Parse config TOML without resolving it.
    pub fn parse(content: &str) -> GateResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| GateError::Config(format!("config parse error: {e}")))
    }

    /// Merge overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> GateResult<Self> {
        let home = expand_tilde_str(overrides.home.as_deref().unwrap_or(&file.server.home));
        let executable = overrides
            .executable
            .clone()
            .unwrap_or(file.server.executable);
        let executable = expand_tilde_str(&executable).to_string_lossy().into_owned();

        let telnet = ProtocolConfig {
            enabled: file.telnet.enabled,
            port: overrides.telnet_port.unwrap_or(file.telnet.port),
            command: CommandLine::new(executable.clone(), file.telnet.parameters),
            probe: file.telnet.press_esc,
        };
        let ssh = ProtocolConfig {
            enabled: file.ssh.enabled || overrides.enable_ssh,
            port: overrides.ssh_port.unwrap_or(file.ssh.port),
            command: CommandLine::new(executable, file.ssh.parameters),
            // Never probe an SSH client: it speaks first.
            probe: false,
        };
        let binkp = ProtocolConfig {
            enabled: file.binkp.enabled || overrides.enable_binkp,
            port: overrides.binkp_port.unwrap_or(file.binkp.port),
            command: CommandLine::new(
                expand_tilde_str(&file.binkp.executable)
                    .to_string_lossy()
                    .into_owned(),
                file.binkp.parameters,
            ),
            probe: false,
        };

        let blocking = BlockingConfig {
            use_good_ip: file.blocking.use_good_ip,
            good_ip_file: resolve_against(&home, &file.blocking.good_ip_file),
            use_bad_ip: file.blocking.use_bad_ip,
            bad_ip_file: resolve_against(&home, &file.blocking.bad_ip_file),
            auto_ban: file.blocking.auto_ban,
            ban_sessions: file.blocking.ban_sessions,
            ban_window_secs: file.blocking.ban_window_secs,
            use_dnsrbl: file.blocking.use_dnsrbl,
            dnsrbl_servers: file.blocking.dnsrbl_servers,
            dnscc_server: file.blocking.dnscc_server.filter(|s| !s.trim().is_empty()),
            banned_countries: file.blocking.banned_countries,
            max_concurrent: file.blocking.max_concurrent,
        };

        let config = Self {
            bind: file.server.bind,
            home,
            nodes: NodeRange {
                low: file.server.low_node,
                high: file.server.high_node,
            },
            local_node: file.server.local_node,
            launch_local_node: file.server.launch_local_node || overrides.launch_local_node,
            launch_minimized: file.server.launch_minimized,
            telnet,
            ssh,
            binkp,
            blocking,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GateResult<()> {
        if self.nodes.low > self.nodes.high {
            return Err(GateError::Config(format!(
                "low_node ({}) is above high_node ({})",
                self.nodes.low, self.nodes.high
            )));
        }
        if self.nodes.contains(self.local_node) {
            return Err(GateError::Config(format!(
                "local_node {} is inside the pooled range {}..={}",
                self.local_node, self.nodes.low, self.nodes.high
            )));
        }
        if self.binkp.enabled && self.nodes.gateway_number() == self.local_node {
            return Err(GateError::Config(format!(
                "gateway node {} collides with local_node",
                self.nodes.gateway_number()
            )));
        }
        if self.blocking.auto_ban && !self.blocking.use_bad_ip {
            return Err(GateError::Config(
                "auto_ban needs use_bad_ip: bans are kept on the deny list".into(),
            ));
        }
        for (name, proto) in [
            ("telnet", &self.telnet),
            ("ssh", &self.ssh),
            ("binkp", &self.binkp),
        ] {
            if proto.enabled {
                proto
                    .command
                    .validate()
                    .map_err(|e| GateError::Config(format!("[{name}] {e}")))?;
            }
        }
        Ok(())
    }
}

fn resolve_against(home: &Path, path: &str) -> PathBuf {
    let expanded = expand_tilde_str(path);
    if expanded.is_absolute() {
        expanded
    } else {
        home.join(expanded)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
