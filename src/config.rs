use crate::error::ConfigError;
use crate::probe_result::ProbeKind;
use anyhow::{Context, Result};
use bitflags::bitflags;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Keepalive period of the streaming probe. Not user tunable.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(30_000);

pub const DEFAULT_ACCOUNT: &str = "SysvarC1ock11111111111111111111111111111111";
pub const DEFAULT_MAINTENANCE_MARKER: &str = "maintenance";
const DEFAULT_REQUEST_TIMEOUT: u64 = 10;

const PROBE_NAMES: &[&str] = &["GrpcStream", "GrpcCalls", "WebSocketStream", "HttpCalls"];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProbeSet: u8 {
        const GRPC_STREAM = 1;
        const GRPC_CALLS = 2;
        const WEBSOCKET_STREAM = 4;
        const HTTP_CALLS = 8;
    }
}

impl ProbeSet {
    pub fn of(kind: ProbeKind) -> Self {
        match kind {
            ProbeKind::GrpcStream => ProbeSet::GRPC_STREAM,
            ProbeKind::GrpcCalls => ProbeSet::GRPC_CALLS,
            ProbeKind::WebSocketStream => ProbeSet::WEBSOCKET_STREAM,
            ProbeKind::HttpCalls => ProbeSet::HTTP_CALLS,
        }
    }

    pub fn has(&self, kind: ProbeKind) -> bool {
        self.contains(Self::of(kind))
    }

    /// Enabled probes in execution order.
    pub fn kinds(&self) -> Vec<ProbeKind> {
        ProbeKind::ALL
            .into_iter()
            .filter(|kind| self.has(*kind))
            .collect()
    }

    fn from_probe_name(name: &str) -> Option<Self> {
        match name {
            "GrpcStream" => Some(ProbeSet::GRPC_STREAM),
            "GrpcCalls" => Some(ProbeSet::GRPC_CALLS),
            "WebSocketStream" => Some(ProbeSet::WEBSOCKET_STREAM),
            "HttpCalls" => Some(ProbeSet::HTTP_CALLS),
            _ => None,
        }
    }
}

impl Serialize for ProbeSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let names: Vec<&str> = self
            .kinds()
            .into_iter()
            .map(|kind| PROBE_NAMES[kind as usize])
            .collect();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProbeSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProbeSetVisitor;

        impl<'de> Visitor<'de> for ProbeSetVisitor {
            type Value = ProbeSet;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a probe name or an array of probe names")
            }

            fn visit_str<E>(self, value: &str) -> Result<ProbeSet, E>
            where
                E: de::Error,
            {
                ProbeSet::from_probe_name(value)
                    .ok_or_else(|| de::Error::unknown_variant(value, PROBE_NAMES))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<ProbeSet, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut set = ProbeSet::empty();
                while let Some(value) = seq.next_element::<String>()? {
                    match ProbeSet::from_probe_name(&value) {
                        Some(flag) => set |= flag,
                        None => return Err(de::Error::unknown_variant(&value, PROBE_NAMES)),
                    }
                }
                Ok(set)
            }
        }

        deserializer.deserialize_any(ProbeSetVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

/// Fully resolved run configuration. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub grpc_url: Option<String>,
    #[serde(skip)]
    pub grpc_token: Option<String>,
    pub ws_url: Option<String>,
    pub http_url: Option<String>,
    pub duration_secs: u64,
    pub interval_secs: u64,
    pub accounts: Vec<String>,
    pub commitment: Commitment,
    pub request_timeout_secs: u64,
    pub precheck: bool,
    pub maintenance_marker: String,
    pub parallel: bool,
    pub verbose_errors: bool,
    pub probes: ProbeSet,
}

impl Config {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn endpoint(&self, kind: ProbeKind) -> Option<&str> {
        match kind {
            ProbeKind::GrpcStream | ProbeKind::GrpcCalls => self.grpc_url.as_deref(),
            ProbeKind::WebSocketStream => self.ws_url.as_deref(),
            ProbeKind::HttpCalls => self.http_url.as_deref(),
        }
    }

    /// Merge the optional TOML file under `overrides` and validate the result.
    pub fn load(path: Option<&Path>, overrides: ConfigLayer) -> Result<Self> {
        let base = match path {
            Some(path) => ConfigLayer::load_from_file(path)?,
            None => ConfigLayer::default(),
        };
        Ok(Self::resolve(base.merge(overrides))?)
    }

    pub fn resolve(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let probes = layer.probes.resolve();
        let ConfigLayer { endpoints, test, .. } = layer;

        let mut missing = Vec::new();
        if test.duration.is_none() {
            missing.push("TEST_DURATION".to_string());
        }
        if test.interval.is_none() {
            missing.push("TEST_INTERVAL".to_string());
        }
        if probes.intersects(ProbeSet::GRPC_STREAM | ProbeSet::GRPC_CALLS)
            && endpoints.grpc_url.is_none()
        {
            missing.push("GRPC_URL".to_string());
        }
        if probes.has(ProbeKind::WebSocketStream) && endpoints.ws_url.is_none() {
            missing.push("WS_URL".to_string());
        }
        if probes.has(ProbeKind::HttpCalls) && endpoints.http_url.is_none() {
            missing.push("HTTP_URL".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let duration_secs = test.duration.unwrap_or_default();
        if duration_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "TEST_DURATION",
                reason: "must be greater than zero".into(),
            });
        }

        let accounts: Vec<String> = test
            .accounts
            .unwrap_or_else(|| vec![DEFAULT_ACCOUNT.to_string()])
            .into_iter()
            .map(|account| account.trim().to_string())
            .filter(|account| !account.is_empty())
            .collect();
        if accounts.is_empty() {
            return Err(ConfigError::Invalid {
                key: "TEST_ACCOUNTS",
                reason: "at least one account is required".into(),
            });
        }

        let request_timeout_secs = test.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        if request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Config {
            grpc_url: endpoints.grpc_url,
            grpc_token: endpoints.grpc_token.filter(|token| !token.is_empty()),
            ws_url: endpoints.ws_url,
            http_url: endpoints.http_url,
            duration_secs,
            interval_secs: test.interval.unwrap_or_default(),
            accounts,
            commitment: test.commitment.unwrap_or_default(),
            request_timeout_secs,
            precheck: test.precheck.unwrap_or(true),
            maintenance_marker: test
                .maintenance_marker
                .unwrap_or_else(|| DEFAULT_MAINTENANCE_MARKER.to_string()),
            parallel: test.parallel.unwrap_or(false),
            verbose_errors: test.verbose_errors.unwrap_or(false),
            probes,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grpc_url: None,
            grpc_token: None,
            ws_url: None,
            http_url: None,
            duration_secs: 60,
            interval_secs: 5,
            accounts: vec![DEFAULT_ACCOUNT.to_string()],
            commitment: Commitment::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT,
            precheck: true,
            maintenance_marker: DEFAULT_MAINTENANCE_MARKER.to_string(),
            parallel: false,
            verbose_errors: false,
            probes: ProbeSet::empty(),
        }
    }
}

/// One source of settings (TOML file, environment or CLI). Unset values defer
/// to lower layers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub endpoints: EndpointLayer,
    pub test: TestLayer,
    pub probes: ProbeLayer,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TestLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Commitment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precheck: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_marker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose_errors: Option<bool>,
}

/// `enabled` lists probes by name; the per-probe switches flip single probes on
/// or off on top of it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<ProbeSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_calls: Option<bool>,
}

impl ProbeLayer {
    fn resolve(&self) -> ProbeSet {
        let mut set = self.enabled.unwrap_or_default();
        let switches = [
            (self.grpc_stream, ProbeSet::GRPC_STREAM),
            (self.grpc_calls, ProbeSet::GRPC_CALLS),
            (self.websocket_stream, ProbeSet::WEBSOCKET_STREAM),
            (self.http_calls, ProbeSet::HTTP_CALLS),
        ];
        for (switch, flag) in switches {
            if let Some(on) = switch {
                set.set(flag, on);
            }
        }
        set
    }
}

impl ConfigLayer {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let layer: ConfigLayer = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(layer)
    }

    /// Values set in `over` win.
    pub fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            endpoints: EndpointLayer {
                grpc_url: over.endpoints.grpc_url.or(self.endpoints.grpc_url),
                grpc_token: over.endpoints.grpc_token.or(self.endpoints.grpc_token),
                ws_url: over.endpoints.ws_url.or(self.endpoints.ws_url),
                http_url: over.endpoints.http_url.or(self.endpoints.http_url),
            },
            test: TestLayer {
                duration: over.test.duration.or(self.test.duration),
                interval: over.test.interval.or(self.test.interval),
                accounts: over.test.accounts.or(self.test.accounts),
                commitment: over.test.commitment.or(self.test.commitment),
                request_timeout: over.test.request_timeout.or(self.test.request_timeout),
                precheck: over.test.precheck.or(self.test.precheck),
                maintenance_marker: over
                    .test
                    .maintenance_marker
                    .or(self.test.maintenance_marker),
                parallel: over.test.parallel.or(self.test.parallel),
                verbose_errors: over.test.verbose_errors.or(self.test.verbose_errors),
            },
            probes: ProbeLayer {
                enabled: over.probes.enabled.or(self.probes.enabled),
                grpc_stream: over.probes.grpc_stream.or(self.probes.grpc_stream),
                grpc_calls: over.probes.grpc_calls.or(self.probes.grpc_calls),
                websocket_stream: over.probes.websocket_stream.or(self.probes.websocket_stream),
                http_calls: over.probes.http_calls.or(self.probes.http_calls),
            },
        }
    }

    pub fn example() -> Self {
        ConfigLayer {
            endpoints: EndpointLayer {
                grpc_url: Some("https://grpc.example.com:443".into()),
                grpc_token: Some("REPLACE_WITH_TOKEN".into()),
                ws_url: Some("wss://rpc.example.com".into()),
                http_url: Some("https://rpc.example.com".into()),
            },
            test: TestLayer {
                duration: Some(60),
                interval: Some(5),
                accounts: Some(vec![DEFAULT_ACCOUNT.to_string()]),
                commitment: Some(Commitment::Confirmed),
                request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
                precheck: Some(true),
                maintenance_marker: Some(DEFAULT_MAINTENANCE_MARKER.to_string()),
                parallel: Some(false),
                verbose_errors: Some(false),
            },
            probes: ProbeLayer {
                enabled: Some(ProbeSet::all()),
                ..ProbeLayer::default()
            },
        }
    }

    pub fn generate_default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::example()).context("serialize default config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with_timing() -> ConfigLayer {
        let mut layer = ConfigLayer::default();
        layer.test.duration = Some(30);
        layer.test.interval = Some(0);
        layer
    }

    #[test]
    fn lists_every_missing_key() {
        let mut layer = ConfigLayer::default();
        layer.probes.enabled = Some(ProbeSet::all());
        match Config::resolve(layer) {
            Err(ConfigError::Missing(keys)) => assert_eq!(
                keys,
                vec!["TEST_DURATION", "TEST_INTERVAL", "GRPC_URL", "WS_URL", "HTTP_URL"]
            ),
            other => panic!("expected missing keys, got {:?}", other),
        }
    }

    #[test]
    fn only_enabled_probes_need_endpoints() {
        let mut layer = layer_with_timing();
        layer.probes.http_calls = Some(true);
        layer.endpoints.http_url = Some("http://localhost:8899".into());

        let config = Config::resolve(layer).unwrap();
        assert_eq!(config.probes.kinds(), vec![ProbeKind::HttpCalls]);
        assert_eq!(config.accounts, vec![DEFAULT_ACCOUNT.to_string()]);
        assert!(config.precheck);
        assert_eq!(config.commitment, Commitment::Confirmed);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut layer = layer_with_timing();
        layer.test.duration = Some(0);
        assert!(matches!(
            Config::resolve(layer),
            Err(ConfigError::Invalid { key: "TEST_DURATION", .. })
        ));
    }

    #[test]
    fn blank_accounts_are_rejected() {
        let mut layer = layer_with_timing();
        layer.test.accounts = Some(vec![" ".into(), String::new()]);
        assert!(matches!(
            Config::resolve(layer),
            Err(ConfigError::Invalid { key: "TEST_ACCOUNTS", .. })
        ));
    }

    #[test]
    fn empty_token_counts_as_unset() {
        let mut layer = layer_with_timing();
        layer.endpoints.grpc_token = Some(String::new());
        assert!(Config::resolve(layer).unwrap().grpc_token.is_none());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file: ConfigLayer = toml::from_str(
            r#"
            [endpoints]
            grpc_url = "https://file.example:443"
            ws_url = "wss://file.example"

            [test]
            duration = 120
            interval = 3
            accounts = ["A", "B"]
            commitment = "finalized"

            [probes]
            enabled = ["GrpcStream", "WebSocketStream"]
            "#,
        )
        .unwrap();

        let mut overrides = ConfigLayer::default();
        overrides.endpoints.grpc_url = Some("https://env.example:443".into());
        overrides.test.duration = Some(10);
        overrides.probes.websocket_stream = Some(false);

        let config = Config::resolve(file.merge(overrides)).unwrap();
        assert_eq!(config.grpc_url.as_deref(), Some("https://env.example:443"));
        assert_eq!(config.duration_secs, 10);
        assert_eq!(config.interval_secs, 3);
        assert_eq!(config.accounts, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(config.commitment, Commitment::Finalized);
        assert_eq!(config.probes, ProbeSet::GRPC_STREAM);
    }

    #[test]
    fn probe_set_accepts_single_name_and_rejects_unknown() {
        #[derive(Deserialize)]
        struct Wrapper {
            probes: ProbeSet,
        }

        let single: Wrapper = toml::from_str(r#"probes = "HttpCalls""#).unwrap();
        assert_eq!(single.probes, ProbeSet::HTTP_CALLS);

        let empty: Wrapper = toml::from_str("probes = []").unwrap();
        assert!(empty.probes.is_empty());

        assert!(toml::from_str::<Wrapper>(r#"probes = ["Carrier"]"#).is_err());
    }

    #[test]
    fn default_toml_resolves() {
        let text = ConfigLayer::generate_default_toml().unwrap();
        let layer: ConfigLayer = toml::from_str(&text).unwrap();
        let config = Config::resolve(layer).unwrap();
        assert_eq!(config.probes, ProbeSet::all());
        assert_eq!(config.probes.kinds(), ProbeKind::ALL.to_vec());
    }
}
