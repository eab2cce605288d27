use anyhow::{bail, Context};
use regex::Regex;
use retrace_core::{HeaderReplacement, Layout};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub layout: Layout,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub source_type: String,
    pub source_port: u16,
    pub target_type: String,
    pub target_host: String,
    pub target_port: u16,
    /// Path answered with a bare 200 in replay mode.
    #[serde(default)]
    pub health: Option<String>,
    /// Request headers dropped before hashing and persisting.
    #[serde(default)]
    pub redact_request_headers: Vec<String>,
    #[serde(default)]
    pub response_header_replacements: Vec<ReplacementConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementConfig {
    pub header: String,
    pub regex: String,
    pub replace: String,
}

/// An endpoint ready to serve: validated, with its regexes compiled.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub config: EndpointConfig,
    pub replacements: Vec<HeaderReplacement>,
}

impl Endpoint {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.config.source_port))
    }

    /// `http://host:port` or `https://host:port`.
    pub fn target_base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.config.target_type, self.config.target_host, self.config.target_port
        )
    }

    /// WebSocket URL for `path_and_query`, `wss` when the target is https.
    pub fn websocket_url(&self, path_and_query: &str) -> String {
        let scheme = if self.config.target_type == "https" {
            "wss"
        } else {
            "ws"
        };
        format!(
            "{}://{}:{}{}",
            scheme, self.config.target_host, self.config.target_port, path_and_query
        )
    }

    pub fn is_health_check(&self, path: &str) -> bool {
        self.config.health.as_deref() == Some(path)
    }

    pub fn name(&self) -> String {
        format!(":{} -> {}", self.config.source_port, self.target_base_url())
    }
}

impl EndpointConfig {
    pub fn compile(&self) -> anyhow::Result<Endpoint> {
        if self.source_type != "http" {
            bail!(
                "endpoint on port {}: unsupported source_type {:?} (only \"http\" is served)",
                self.source_port,
                self.source_type
            );
        }
        if self.target_type != "http" && self.target_type != "https" {
            bail!(
                "endpoint on port {}: unsupported target_type {:?}",
                self.source_port,
                self.target_type
            );
        }
        if self.target_host.is_empty() {
            bail!("endpoint on port {}: target_host is empty", self.source_port);
        }

        let replacements = self
            .response_header_replacements
            .iter()
            .map(|r| {
                let pattern = Regex::new(&r.regex).with_context(|| {
                    format!(
                        "endpoint on port {}: invalid regex {:?} for header {}",
                        self.source_port, r.regex, r.header
                    )
                })?;
                Ok(HeaderReplacement {
                    header: r.header.clone(),
                    pattern,
                    replace: r.replace.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Endpoint {
            config: self.clone(),
            replacements,
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.compile_endpoints().map(|_| ())
    }

    pub fn compile_endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        if self.endpoints.is_empty() {
            bail!("no endpoints configured");
        }
        let mut ports = HashSet::new();
        for endpoint in &self.endpoints {
            if !ports.insert(endpoint.source_port) {
                bail!("source_port {} is used by more than one endpoint", endpoint.source_port);
            }
        }
        self.endpoints.iter().map(EndpointConfig::compile).collect()
    }
}
