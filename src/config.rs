//! Configuração do framewright carregada a partir de `framewright.toml`.
//!
//! A struct [`FramewrightConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `FRAMEWRIGHT_LOG` tem precedência sobre o arquivo
//! para o nível de log.

use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ErrorClass, FramewrightError};
use crate::resilience::{BatchOptions, DependencyClass, DependencyProfile, DependencyRegistry};

/// Caminho padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_PATH: &str = "framewright.toml";

/// Configuração de nível superior carregada de `framewright.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FramewrightConfig {
    /// Nível de log usado quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tamanho dos lotes e pausa entre eles.
    #[serde(default)]
    pub batch: BatchOptions,

    /// Dependências nomeadas, cada uma com sua classe e ajustes opcionais.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySettings>,
}

/// Ajustes de uma dependência em `[dependencies.<nome>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencySettings {
    pub class: DependencyClass,

    #[serde(default)]
    pub breaker: BreakerOverrides,

    #[serde(default)]
    pub retry: RetryOverrides,
}

/// Campos do circuit breaker que substituem o perfil da classe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub success_threshold: Option<u32>,
}

/// Campos da política de retentativa que substituem o perfil da classe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub retry_on: Option<Vec<ErrorClass>>,
    pub jitter: Option<bool>,
}

// Valor padrão para o nível de log: "info".
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FramewrightConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            batch: BatchOptions::default(),
            dependencies: BTreeMap::new(),
        }
    }
}

impl DependencySettings {
    /// Aplica os ajustes sobre o perfil padrão da classe.
    pub fn profile(&self) -> DependencyProfile {
        let mut profile = self.class.profile();

        let b = &self.breaker;
        if let Some(v) = b.failure_threshold {
            profile.breaker.failure_threshold = v;
        }
        if let Some(v) = b.recovery_timeout_ms {
            profile.breaker.recovery_timeout_ms = v;
        }
        if let Some(v) = b.success_threshold {
            profile.breaker.success_threshold = v;
        }

        let r = &self.retry;
        if let Some(v) = r.max_retries {
            profile.retry.max_retries = v;
        }
        if let Some(v) = r.base_delay_ms {
            profile.retry.base_delay_ms = v;
        }
        if let Some(v) = r.max_delay_ms {
            profile.retry.max_delay_ms = v;
        }
        if let Some(v) = r.backoff_multiplier {
            profile.retry.backoff_multiplier = v;
        }
        if let Some(v) = &r.retry_on {
            profile.retry.retry_on = v.clone();
        }
        if let Some(v) = r.jitter {
            profile.retry.jitter = v;
        }

        profile
    }
}

impl FramewrightConfig {
    /// Carrega a configuração de `framewright.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<FramewrightConfig>(&contents).map_err(FramewrightError::from)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para o nível de log.
        if let Ok(level) = std::env::var("FRAMEWRIGHT_LOG")
            && !level.is_empty()
        {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores que tornariam o breaker ou o backoff inúteis.
    pub fn validate(&self) -> Result<(), FramewrightError> {
        if self.batch.batch_size == 0 {
            return Err(FramewrightError::Config("batch.batch_size must be at least 1".into()));
        }
        for (name, settings) in &self.dependencies {
            let profile = settings.profile();
            if profile.breaker.failure_threshold == 0 || profile.breaker.success_threshold == 0 {
                return Err(FramewrightError::Config(format!(
                    "dependency '{name}': breaker thresholds must be at least 1"
                )));
            }
            if profile.retry.backoff_multiplier < 1.0 {
                return Err(FramewrightError::Config(format!(
                    "dependency '{name}': backoff_multiplier must be >= 1.0"
                )));
            }
            if profile.retry.retry_on.contains(&ErrorClass::NonRetryable) {
                return Err(FramewrightError::Config(format!(
                    "dependency '{name}': retry_on cannot include non_retryable"
                )));
            }
            if profile.retry.base_delay_ms > profile.retry.max_delay_ms {
                return Err(FramewrightError::Config(format!(
                    "dependency '{name}': base_delay_ms exceeds max_delay_ms"
                )));
            }
        }
        Ok(())
    }

    /// Monta o registro de dependências: as configuradas primeiro, depois
    /// uma por classe com o perfil padrão.
    pub fn registry(&self) -> DependencyRegistry {
        let registry = DependencyRegistry::new();
        for (name, settings) in &self.dependencies {
            registry.register(name, settings.profile());
        }
        for class in DependencyClass::ALL {
            registry.register(class.as_str(), class.profile());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = FramewrightConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.pacing_ms, 0);
        assert!(config.dependencies.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            log_level = "debug"

            [batch]
            pacing_ms = 500

            [dependencies.orders-db]
            class = "database"

            [dependencies.orders-db.breaker]
            failure_threshold = 2

            [dependencies.claude]
            class = "ai_provider"

            [dependencies.claude.retry]
            max_retries = 0
            retry_on = ["rate_limited"]
        "#;
        let config: FramewrightConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.pacing_ms, 500);

        let db = config.dependencies["orders-db"].profile();
        let defaults = DependencyClass::Database.profile();
        assert_eq!(db.breaker.failure_threshold, 2);
        assert_eq!(db.breaker.recovery_timeout_ms, defaults.breaker.recovery_timeout_ms);
        assert_eq!(db.retry, defaults.retry);

        let claude = config.dependencies["claude"].profile();
        assert_eq!(claude.class, DependencyClass::AiProvider);
        assert_eq!(claude.retry.max_retries, 0);
        assert_eq!(claude.retry.retry_on, vec![ErrorClass::RateLimited]);
        assert!(claude.retry.jitter);
    }

    #[test]
    fn unknown_class_is_rejected() {
        let toml_str = r#"
            [dependencies.fax]
            class = "fax_machine"
        "#;
        assert!(toml::from_str::<FramewrightConfig>(toml_str).is_err());
    }

    #[test]
    fn load_from_file_and_build_registry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [dependencies.square]
            class = "payment"

            [dependencies.square.breaker]
            failure_threshold = 1
            "#
        )
        .unwrap();

        let config = FramewrightConfig::load_from(file.path()).unwrap();
        let registry = config.registry();

        let square = registry.profile("square").unwrap();
        assert_eq!(square.class, DependencyClass::Payment);
        assert_eq!(square.breaker.failure_threshold, 1);
        assert!(registry.get("database").is_some());
        assert_eq!(registry.names().len(), 6);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [dependencies.twilio]
            class = "sms"

            [dependencies.twilio.retry]
            base_delay_ms = 9000
            max_delay_ms = 100
            "#
        )
        .unwrap();

        let err = FramewrightConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("base_delay_ms exceeds max_delay_ms"));
    }

    #[test]
    fn retrying_non_retryable_errors_is_rejected() {
        let config: FramewrightConfig = toml::from_str(
            r#"
            [dependencies.square]
            class = "payment"

            [dependencies.square.retry]
            retry_on = ["transient", "non_retryable"]
            "#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_on cannot include non_retryable"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FramewrightConfig::load_from(&dir.path().join("framewright.toml")).unwrap();
        assert_eq!(config.batch.batch_size, 10);
        assert!(config.dependencies.is_empty());
    }
}
