use crate::domain::model::EntityKind;
use crate::utils::error::{ImportError, Result};
use crate::utils::logger::LogFormat;
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub orgmeter: OrgMeterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub funders: Vec<FunderConfig>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
    pub monitoring: Option<MonitoringConfig>,
    pub error_handling: Option<ErrorHandlingConfig>,
    pub export: Option<ExportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMeterConfig {
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_entity_delay_ms")]
    pub entity_delay_ms: u64,
    pub max_pages: Option<u32>,
}

fn default_page_size() -> u32 {
    100
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_page_delay_ms() -> u64 {
    500
}

fn default_entity_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Update existing records only when the payload changed.
    #[default]
    UpdateIfChanged,
    /// Always rewrite existing records.
    Overwrite,
    /// Only insert records not stored yet.
    SkipExisting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_database_path() -> String {
    "./orgmeter-sync.db".to_string()
}

fn default_batch_size() -> usize {
    1000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            batch_size: default_batch_size(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunderConfig {
    pub id: String,
    pub api_key: String,
    pub base_url: Option<String>,
    /// Restricts the import to these entity kinds.
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    pub enabled: Option<bool>,
    pub path: Option<String>,
    pub field_mapping: Option<HashMap<String, String>>,
    pub filters: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnEntityFailure {
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub on_entity_failure: OnEntityFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub output_path: String,
}

impl SyncConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);
        Ok(toml::from_str(&processed_content)?)
    }

    /// 替換環境變數 (例如 ${ORGMETER_API_KEY})，未設定的保持原樣
    fn substitute_env_vars(content: &str) -> String {
        use regex::Regex;
        use std::sync::OnceLock;

        static ENV_VAR: OnceLock<Regex> = OnceLock::new();
        let re = ENV_VAR.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_url("orgmeter.base_url", &self.orgmeter.base_url)?;
        validation::validate_range("orgmeter.page_size", self.orgmeter.page_size, 1, 1000)?;
        validation::validate_positive_number(
            "orgmeter.timeout_seconds",
            self.orgmeter.timeout_seconds as usize,
            1,
        )?;
        if let Some(max_pages) = self.orgmeter.max_pages {
            validation::validate_positive_number("orgmeter.max_pages", max_pages as usize, 1)?;
        }
        validation::validate_path("store.database_path", &self.store.database_path)?;
        validation::validate_positive_number("store.batch_size", self.store.batch_size, 1)?;

        if self.funders.is_empty() {
            return Err(ImportError::MissingConfigError {
                field: "funders".to_string(),
            });
        }
        validation::validate_unique("funders.id", self.funders.iter().map(|f| f.id.as_str()))?;

        for (index, funder) in self.funders.iter().enumerate() {
            validation::validate_non_empty_string(&format!("funders[{}].id", index), &funder.id)?;
            validation::validate_secret(&format!("funders[{}].api_key", index), &funder.api_key)?;
            if let Some(base_url) = &funder.base_url {
                validation::validate_url(&format!("funders[{}].base_url", index), base_url)?;
            }
            for name in funder.entities.iter().flatten() {
                parse_entity(&format!("funders[{}].entities", index), name)?;
            }
        }

        for (name, entity) in &self.entities {
            parse_entity("entities", name)?;
            if let Some(path) = &entity.path {
                validation::validate_non_empty_string(&format!("entities.{}.path", name), path)?;
            }
        }

        if let Some(format) = self.monitoring.as_ref().and_then(|m| m.log_format.as_ref()) {
            format
                .parse::<LogFormat>()
                .map_err(|reason| ImportError::InvalidConfigValueError {
                    field: "monitoring.log_format".to_string(),
                    value: format.clone(),
                    reason,
                })?;
        }

        if let Some(export) = &self.export {
            validation::validate_path("export.output_path", &export.output_path)?;
        }

        Ok(())
    }

    pub fn funder(&self, id: &str) -> Option<&FunderConfig> {
        self.funders.iter().find(|f| f.id == id)
    }

    pub fn base_url_for<'a>(&'a self, funder: &'a FunderConfig) -> &'a str {
        funder.base_url.as_deref().unwrap_or(&self.orgmeter.base_url)
    }

    /// Settings for one entity kind, or defaults when the section is absent.
    pub fn entity_config(&self, kind: EntityKind) -> EntityConfig {
        self.entities
            .iter()
            .find(|(name, _)| name.parse::<EntityKind>().ok() == Some(kind))
            .map(|(_, cfg)| cfg.clone())
            .unwrap_or_default()
    }

    pub fn entity_path(&self, kind: EntityKind) -> String {
        self.entity_config(kind)
            .path
            .unwrap_or_else(|| kind.default_path().to_string())
    }

    /// Entity kinds to import for a funder, in `EntityKind::ALL` order.
    pub fn enabled_entities(&self, funder: &FunderConfig) -> Vec<EntityKind> {
        let allowed: Option<Vec<EntityKind>> = funder
            .entities
            .as_ref()
            .map(|names| names.iter().filter_map(|n| n.parse().ok()).collect());

        EntityKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.entity_config(*kind).enabled.unwrap_or(true))
            .filter(|kind| allowed.as_ref().is_none_or(|list| list.contains(kind)))
            .collect()
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.orgmeter.page_delay_ms)
    }

    pub fn entity_delay(&self) -> Duration {
        Duration::from_millis(self.orgmeter.entity_delay_ms)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn log_format(&self) -> LogFormat {
        self.monitoring
            .as_ref()
            .and_then(|m| m.log_format.as_deref())
            .and_then(|f| f.parse().ok())
            .unwrap_or_default()
    }

    pub fn on_entity_failure(&self) -> OnEntityFailure {
        self.error_handling
            .as_ref()
            .map(|e| e.on_entity_failure)
            .unwrap_or_default()
    }

    pub fn export_path(&self) -> &str {
        self.export
            .as_ref()
            .map(|e| e.output_path.as_str())
            .unwrap_or("./exports")
    }
}

fn parse_entity(field: &str, name: &str) -> Result<EntityKind> {
    name.parse::<EntityKind>()
        .map_err(|reason| ImportError::InvalidConfigValueError {
            field: field.to_string(),
            value: name.to_string(),
            reason,
        })
}

impl Validate for SyncConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[orgmeter]
base_url = "https://orgmeter.example.com/api/v1"

[[funders]]
id = "acme-capital"
api_key = "om_key_1"
"#;

    #[test]
    fn test_parse_basic_config_applies_defaults() {
        let config = SyncConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.orgmeter.page_size, 100);
        assert_eq!(config.orgmeter.retry_attempts, 3);
        assert_eq!(config.store.batch_size, 1000);
        assert_eq!(config.store.conflict_policy, ConflictPolicy::UpdateIfChanged);
        assert_eq!(config.on_entity_failure(), OnEntityFailure::Continue);
        assert_eq!(config.page_delay(), Duration::from_millis(500));
        assert!(!config.monitoring_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TEST_ORGMETER_KEY_SUBST", "om_secret");

        let toml_content = r#"
[orgmeter]
base_url = "https://orgmeter.example.com/api/v1"

[[funders]]
id = "acme-capital"
api_key = "${TEST_ORGMETER_KEY_SUBST}"
"#;

        let config = SyncConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.funders[0].api_key, "om_secret");

        std::env::remove_var("TEST_ORGMETER_KEY_SUBST");
    }

    #[test]
    fn test_unresolved_api_key_fails_validation() {
        let toml_content = r#"
[orgmeter]
base_url = "https://orgmeter.example.com/api/v1"

[[funders]]
id = "acme-capital"
api_key = "${TEST_ORGMETER_KEY_NEVER_SET}"
"#;

        let config = SyncConfig::from_toml_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config.orgmeter.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config.orgmeter.base_url = "invalid-url".to_string();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config.funders.push(config.funders[0].clone());
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config.funders.clear();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config.orgmeter.max_pages = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ImportError::InvalidConfigValueError { ref field, .. }) if field == "orgmeter.max_pages"
        ));
        config.orgmeter.max_pages = Some(1);
        assert!(config.validate().is_ok());

        let mut config = SyncConfig::from_toml_str(BASIC).unwrap();
        config
            .entities
            .insert("leads".to_string(), EntityConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_entities_respects_sections_and_funder_list() {
        let toml_content = r#"
[orgmeter]
base_url = "https://orgmeter.example.com/api/v1"

[[funders]]
id = "acme-capital"
api_key = "k1"

[[funders]]
id = "beta-funding"
api_key = "k2"
entities = ["advances", "merchant", "user"]

[entities.user]
enabled = false

[entities.merchant]
path = "merchant-accounts"
field_mapping = { dba = "dba_name" }
"#;

        let config = SyncConfig::from_toml_str(toml_content).unwrap();
        assert!(config.validate().is_ok());

        let acme = config.funder("acme-capital").unwrap();
        assert_eq!(
            config.enabled_entities(acme),
            vec![
                EntityKind::Merchant,
                EntityKind::Iso,
                EntityKind::Advance,
                EntityKind::Syndicator,
                EntityKind::Contact,
            ]
        );

        let beta = config.funder("beta-funding").unwrap();
        assert_eq!(
            config.enabled_entities(beta),
            vec![EntityKind::Merchant, EntityKind::Advance]
        );

        assert_eq!(config.entity_path(EntityKind::Merchant), "merchant-accounts");
        assert_eq!(config.entity_path(EntityKind::Iso), "isos");
        assert_eq!(
            config
                .entity_config(EntityKind::Merchant)
                .field_mapping
                .unwrap()
                .get("dba"),
            Some(&"dba_name".to_string())
        );
    }

    #[test]
    fn test_funder_base_url_override() {
        let toml_content = r#"
[orgmeter]
base_url = "https://orgmeter.example.com/api/v1"

[[funders]]
id = "acme-capital"
api_key = "k1"
base_url = "https://acme.orgmeter.example.com/api/v1"
"#;
        let config = SyncConfig::from_toml_str(toml_content).unwrap();
        let funder = config.funder("acme-capital").unwrap();
        assert_eq!(
            config.base_url_for(funder),
            "https://acme.orgmeter.example.com/api/v1"
        );
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();

        let config = SyncConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.funders[0].id, "acme-capital");
        assert_eq!(config.export_path(), "./exports");
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            SyncConfig::from_toml_str(include_str!("../../orgmeter-sync.example.toml")).unwrap();

        assert_eq!(config.funders.len(), 2);
        assert_eq!(config.store.conflict_policy, ConflictPolicy::UpdateIfChanged);
        assert!(!config.enabled_entities(&config.funders[0]).contains(&EntityKind::User));
        assert_eq!(
            config.enabled_entities(&config.funders[1]),
            vec![EntityKind::Merchant, EntityKind::Advance]
        );
        // Keys stay unresolved without the env vars, which validation rejects.
        if std::env::var("ACME_ORGMETER_API_KEY").is_err() {
            assert!(config.validate().is_err());
        }
    }
}
