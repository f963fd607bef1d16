use crate::catalog::CatalogConfig;
use crate::domain::value_objects::Mode;
use crate::insight::InsightConfig;
use crate::leader::LeaderConfig;
use crate::sync::SessionConfig;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} is required in zone mode")]
    MissingZoneSetting(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Resource store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Identity
    pub mode: Mode,
    pub zone: Option<String>,
    pub instance_id: String,

    // Addresses
    pub advertise_addr: String,
    pub sync_listen_addr: String,
    pub global_addr: Option<String>,
    pub api_listen_addr: String,

    // Store
    pub store: StoreBackend,
    pub db_path: String,
    pub event_bus_buffer_size: usize,
    pub store_timeout_secs: u64,

    // Catalog
    pub catalog_heartbeat_secs: u64,
    pub catalog_writer_secs: u64,
    pub catalog_staleness_multiplier: u32,

    // Sync sessions and liveness
    pub session_heartbeat_secs: u64,
    pub insight_flush_secs: u64,
    pub insight_missed_heartbeats: u32,
    pub insight_max_subscriptions: usize,
    pub reconnect_backoff_max_secs: u64,

    // Leader election
    pub lease_ttl_secs: u64,
    pub lease_renew_secs: u64,
    pub leader_grace_secs: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Global,
            zone: None,
            instance_id: generated_instance_id(),
            advertise_addr: "127.0.0.1:5685".to_string(),
            sync_listen_addr: "0.0.0.0:5685".to_string(),
            global_addr: None,
            api_listen_addr: "0.0.0.0:5681".to_string(),
            store: StoreBackend::Memory,
            db_path: "mesh-sync.db".to_string(),
            event_bus_buffer_size: 100,
            store_timeout_secs: 3,
            catalog_heartbeat_secs: 5,
            catalog_writer_secs: 15,
            catalog_staleness_multiplier: 3,
            session_heartbeat_secs: 5,
            insight_flush_secs: 10,
            insight_missed_heartbeats: 3,
            insight_max_subscriptions: 10,
            reconnect_backoff_max_secs: 30,
            lease_ttl_secs: 15,
            lease_renew_secs: 5,
            leader_grace_secs: 2,
            debug: false,
        }
    }
}

fn generated_instance_id() -> String {
    format!("cp-{}", uuid::Uuid::new_v4())
}

impl Config {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == Mode::Zone {
            if self.zone.as_deref().map_or(true, |z| z.trim().is_empty()) {
                return Err(ConfigError::MissingZoneSetting("MESHSYNC_ZONE"));
            }
            if self.global_addr.as_deref().map_or(true, |a| a.trim().is_empty()) {
                return Err(ConfigError::MissingZoneSetting("MESHSYNC_GLOBAL_ADDR"));
            }
        }

        if self.instance_id.is_empty() || self.instance_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "instance id {:?} must be non-empty and contain no whitespace",
                self.instance_id
            )));
        }

        let intervals = [
            ("MESHSYNC_STORE_TIMEOUT_SECS", self.store_timeout_secs),
            ("MESHSYNC_CATALOG_HEARTBEAT_SECS", self.catalog_heartbeat_secs),
            ("MESHSYNC_CATALOG_WRITER_SECS", self.catalog_writer_secs),
            ("MESHSYNC_SESSION_HEARTBEAT_SECS", self.session_heartbeat_secs),
            ("MESHSYNC_INSIGHT_FLUSH_SECS", self.insight_flush_secs),
            ("MESHSYNC_LEASE_TTL_SECS", self.lease_ttl_secs),
            ("MESHSYNC_LEASE_RENEW_SECS", self.lease_renew_secs),
            ("MESHSYNC_RECONNECT_BACKOFF_MAX_SECS", self.reconnect_backoff_max_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if self.event_bus_buffer_size == 0 || self.insight_max_subscriptions == 0 {
            return Err(ConfigError::Invalid(
                "event bus buffer and subscription history must be non-zero".to_string(),
            ));
        }
        if self.catalog_staleness_multiplier < 1 || self.insight_missed_heartbeats < 1 {
            return Err(ConfigError::Invalid(
                "staleness multiplier and missed heartbeat threshold must be at least 1"
                    .to_string(),
            ));
        }

        self.leader_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let session = self.session_config();
        if session.heartbeat_interval >= session.heartbeat_timeout {
            return Err(ConfigError::Invalid(format!(
                "session heartbeat {:?} must be shorter than the liveness timeout {:?}",
                session.heartbeat_interval, session.heartbeat_timeout
            )));
        }

        Ok(())
    }

    /// Leader slot this replica competes for.
    pub fn leader_slot(&self) -> String {
        match (self.mode, self.zone.as_deref()) {
            (Mode::Zone, Some(zone)) => format!("zone-leader/{}", zone),
            _ => "global-leader".to_string(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn leader_config(&self) -> LeaderConfig {
        LeaderConfig::new(
            Duration::from_secs(self.lease_ttl_secs),
            Duration::from_secs(self.lease_renew_secs),
        )
        .grace_period(Duration::from_secs(self.leader_grace_secs))
        .store_timeout(self.store_timeout())
    }

    pub fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig::new(
            Duration::from_secs(self.catalog_heartbeat_secs),
            Duration::from_secs(self.catalog_writer_secs),
        )
        .staleness_multiplier(self.catalog_staleness_multiplier)
    }

    pub fn insight_config(&self) -> InsightConfig {
        InsightConfig::new(Duration::from_secs(self.insight_flush_secs))
            .missed_heartbeat_threshold(self.insight_missed_heartbeats)
            .max_subscriptions(self.insight_max_subscriptions)
    }

    /// A peer silent for as long as it takes a zone to go offline is dead.
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig::new(
            Duration::from_secs(self.session_heartbeat_secs),
            self.insight_config().timeout(),
        )
        .backoff(
            defaults.reconnect_backoff_initial,
            Duration::from_secs(self.reconnect_backoff_max_secs),
        )
    }
}

/// Load configuration from `MESHSYNC_*` environment variables.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(|name| std::env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
pub fn load_config_from<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let mode = match var("MESHSYNC_MODE") {
        Some(v) => Mode::parse(&v).ok_or(ConfigError::InvalidValue {
            name: "MESHSYNC_MODE",
            value: v,
        })?,
        None => defaults.mode,
    };

    let store = match var("MESHSYNC_STORE") {
        Some(v) => StoreBackend::parse(&v).ok_or(ConfigError::InvalidValue {
            name: "MESHSYNC_STORE",
            value: v,
        })?,
        None => defaults.store,
    };

    let config = Config {
        mode,
        zone: var("MESHSYNC_ZONE"),
        instance_id: var("MESHSYNC_INSTANCE_ID").unwrap_or(defaults.instance_id),
        advertise_addr: var("MESHSYNC_ADVERTISE_ADDR").unwrap_or(defaults.advertise_addr),
        sync_listen_addr: var("MESHSYNC_SYNC_LISTEN_ADDR").unwrap_or(defaults.sync_listen_addr),
        global_addr: var("MESHSYNC_GLOBAL_ADDR"),
        api_listen_addr: var("MESHSYNC_API_LISTEN_ADDR").unwrap_or(defaults.api_listen_addr),
        store,
        db_path: var("MESHSYNC_DB_PATH").unwrap_or(defaults.db_path),
        event_bus_buffer_size: parsed(
            &var,
            "MESHSYNC_EVENT_BUS_BUFFER_SIZE",
            defaults.event_bus_buffer_size,
        )?,
        store_timeout_secs: parsed(&var, "MESHSYNC_STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
        catalog_heartbeat_secs: parsed(
            &var,
            "MESHSYNC_CATALOG_HEARTBEAT_SECS",
            defaults.catalog_heartbeat_secs,
        )?,
        catalog_writer_secs: parsed(
            &var,
            "MESHSYNC_CATALOG_WRITER_SECS",
            defaults.catalog_writer_secs,
        )?,
        catalog_staleness_multiplier: parsed(
            &var,
            "MESHSYNC_CATALOG_STALENESS_MULTIPLIER",
            defaults.catalog_staleness_multiplier,
        )?,
        session_heartbeat_secs: parsed(
            &var,
            "MESHSYNC_SESSION_HEARTBEAT_SECS",
            defaults.session_heartbeat_secs,
        )?,
        insight_flush_secs: parsed(&var, "MESHSYNC_INSIGHT_FLUSH_SECS", defaults.insight_flush_secs)?,
        insight_missed_heartbeats: parsed(
            &var,
            "MESHSYNC_INSIGHT_MISSED_HEARTBEATS",
            defaults.insight_missed_heartbeats,
        )?,
        insight_max_subscriptions: parsed(
            &var,
            "MESHSYNC_INSIGHT_MAX_SUBSCRIPTIONS",
            defaults.insight_max_subscriptions,
        )?,
        reconnect_backoff_max_secs: parsed(
            &var,
            "MESHSYNC_RECONNECT_BACKOFF_MAX_SECS",
            defaults.reconnect_backoff_max_secs,
        )?,
        lease_ttl_secs: parsed(&var, "MESHSYNC_LEASE_TTL_SECS", defaults.lease_ttl_secs)?,
        lease_renew_secs: parsed(&var, "MESHSYNC_LEASE_RENEW_SECS", defaults.lease_renew_secs)?,
        leader_grace_secs: parsed(&var, "MESHSYNC_LEADER_GRACE_SECS", defaults.leader_grace_secs)?,
        debug: lookup("DEBUG").is_some(),
    };

    config.validate()?;
    Ok(config)
}

fn parsed<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}
