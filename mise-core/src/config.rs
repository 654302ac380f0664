//! Configuration loading for the cache synchronizer.
//!
//! The configuration is static: per-domain debounce windows and the map from
//! event type to the cache-key patterns it invalidates. It is read once from
//! a TOML file and validated before any coordinator is built.

use crate::{is_envelope_field, ConfigError, DomainName, EventType, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "MISE_SYNC_CONFIG";

/// Upper bound for a debounce window and for a domain's maximum wait.
pub const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// The only placeholder allowed inside a pattern template.
pub const ENTITY_ID_PLACEHOLDER: &str = "{entity_id}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Tenant this coordinator instance acts for.
    pub tenant_id: TenantId,
    /// Force-invalidate every domain after the push channel reconnects.
    #[serde(default)]
    pub resync_on_reconnect: bool,
    pub domains: Vec<DomainConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: DomainName,
    /// Trailing-edge debounce window.
    pub window_ms: u64,
    /// Force a flush once a batch has been open for this many windows.
    #[serde(default)]
    pub max_wait_factor: Option<u32>,
    #[serde(default)]
    pub events: Vec<EventBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBinding {
    pub event_type: EventType,
    /// Pattern templates, `keydomain[/qualifier...]`. The tenant segment is
    /// inserted by the coordinator.
    pub patterns: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optimistic: Option<OptimisticUpdate>,
}

/// In-place cache patch applied before the invalidation is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimisticUpdate {
    /// Key template of the entry to patch.
    pub key: String,
    /// Payload fields merged into the cached record.
    pub fields: Vec<String>,
}

impl SyncConfig {
    /// Load from `--config <path>` or [`CONFIG_PATH_ENV`], then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath {
            env: CONFIG_PATH_ENV,
        })?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a file without validating it.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse and validate an in-memory TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.is_blank() {
            return Err(ConfigError::InvalidValue {
                field: "tenant_id".to_string(),
                value: self.tenant_id.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.domains.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "domains".to_string(),
            });
        }

        let mut names = HashSet::new();
        for domain in &self.domains {
            if !names.insert(&domain.name) {
                return Err(ConfigError::InvalidValue {
                    field: "domains.name".to_string(),
                    value: domain.name.to_string(),
                    reason: "duplicate domain".to_string(),
                });
            }
            domain.validate()?;
        }
        Ok(())
    }

    /// Look up a domain by name.
    pub fn domain(&self, name: &DomainName) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| &d.name == name)
    }
}

impl DomainConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Maximum time a batch may stay open, if capped.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_factor
            .map(|factor| self.window().saturating_mul(factor))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_blank() {
            return Err(ConfigError::InvalidValue {
                field: "domains.name".to_string(),
                value: self.name.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("domains.{}.window_ms", self.name),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(ConfigError::InvalidValue {
                field: format!("domains.{}.window_ms", self.name),
                value: self.window_ms.to_string(),
                reason: format!("must be <= {MAX_WINDOW_MS}"),
            });
        }
        if let Some(factor) = self.max_wait_factor {
            if factor == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("domains.{}.max_wait_factor", self.name),
                    value: factor.to_string(),
                    reason: "must be >= 1".to_string(),
                });
            }
            let capped = self.window_ms.checked_mul(u64::from(factor));
            if capped.map_or(true, |ms| ms > MAX_WINDOW_MS) {
                return Err(ConfigError::InvalidValue {
                    field: format!("domains.{}.max_wait_factor", self.name),
                    value: factor.to_string(),
                    reason: format!("window_ms * max_wait_factor must be <= {MAX_WINDOW_MS}"),
                });
            }
        }

        let mut seen = HashSet::new();
        for binding in &self.events {
            if !seen.insert(&binding.event_type) {
                return Err(ConfigError::InvalidValue {
                    field: format!("domains.{}.events.event_type", self.name),
                    value: binding.event_type.to_string(),
                    reason: "event type bound twice in the same domain".to_string(),
                });
            }
            binding.validate(&self.name)?;
        }
        Ok(())
    }
}

impl EventBinding {
    fn validate(&self, domain: &DomainName) -> Result<(), ConfigError> {
        let prefix = format!("domains.{}.events.{}", domain, self.event_type);
        if self.event_type.is_blank() {
            return Err(ConfigError::InvalidValue {
                field: format!("domains.{domain}.events.event_type"),
                value: self.event_type.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.patterns.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: format!("{prefix}.patterns"),
            });
        }
        for template in &self.patterns {
            validate_template(&format!("{prefix}.patterns"), template)?;
        }
        validate_payload_fields(&format!("{prefix}.required_fields"), &self.required_fields)?;
        if let Some(optimistic) = &self.optimistic {
            validate_template(&format!("{prefix}.optimistic.key"), &optimistic.key)?;
            if optimistic.fields.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("{prefix}.optimistic.fields"),
                });
            }
            validate_payload_fields(&format!("{prefix}.optimistic.fields"), &optimistic.fields)?;
        }
        Ok(())
    }

    /// Fields a payload must carry: declared ones plus everything the
    /// optimistic update merges into the cache.
    pub fn all_required_fields(&self) -> Vec<String> {
        let mut fields = self.required_fields.clone();
        if let Some(optimistic) = &self.optimistic {
            for field in &optimistic.fields {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        }
        fields
    }
}

/// Payload field names must be non-empty and must not name an envelope
/// field, which never reaches the payload.
fn validate_payload_fields(field: &str, names: &[String]) -> Result<(), ConfigError> {
    for name in names {
        let reason = if name.trim().is_empty() {
            "must not be empty"
        } else if is_envelope_field(name) {
            "names an envelope field, not a payload field"
        } else {
            continue;
        };
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: name.clone(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}

/// Check a `keydomain[/qualifier...]` template.
pub fn validate_template(field: &str, template: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        value: template.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = template.split('/').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(invalid("empty segment"));
    }
    if segments[0] == ENTITY_ID_PLACEHOLDER {
        return Err(invalid("key domain cannot be a placeholder"));
    }
    for segment in &segments {
        let braced = segment.contains('{') || segment.contains('}');
        if braced && *segment != ENTITY_ID_PLACEHOLDER {
            return Err(invalid("only {entity_id} is supported as a placeholder"));
        }
    }
    Ok(())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
