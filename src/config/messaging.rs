//! Messaging and broker configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::broker::{BrokerOptions, SaslMechanism, SaslOptions, TlsOptions};

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process transport (no external broker).
    #[default]
    Memory,
    /// Kafka transport.
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Kafka connection settings. Addresses and timeouts also apply to the
    /// memory transport's broker options.
    pub kafka: KafkaBrokerConfig,
}

/// SCRAM/PLAIN algorithm names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslAlgorithm {
    Sha256,
    Sha512,
    Plain,
}

impl std::str::FromStr for SaslAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "plain" => Ok(Self::Plain),
            _ => Err(ConfigError::UnsupportedSaslAlgorithm(s.to_string())),
        }
    }
}

impl From<SaslAlgorithm> for SaslMechanism {
    fn from(algorithm: SaslAlgorithm) -> Self {
        match algorithm {
            SaslAlgorithm::Sha256 => SaslMechanism::ScramSha256,
            SaslAlgorithm::Sha512 => SaslMechanism::ScramSha512,
            SaslAlgorithm::Plain => SaslMechanism::Plain,
        }
    }
}

/// Kafka broker configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct KafkaBrokerConfig {
    /// Bootstrap addresses.
    pub addresses: Vec<String>,
    pub sasl_enabled: bool,
    pub sasl_user: String,
    pub sasl_password: String,
    /// `sha256`, `sha512` or `plain`.
    pub sasl_algorithm: String,
    pub tls_enabled: bool,
    pub tls_skip_verify: bool,
    pub tls_client_cert_file: String,
    pub tls_client_key_file: String,
    pub tls_ca_cert_file: String,
    /// Default wait for request/reply, in seconds.
    pub reply_timeout_secs: u64,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            addresses: vec![crate::broker::options::DEFAULT_ADDRESS.to_string()],
            sasl_enabled: false,
            sasl_user: String::new(),
            sasl_password: String::new(),
            sasl_algorithm: "sha512".to_string(),
            tls_enabled: false,
            tls_skip_verify: false,
            tls_client_cert_file: String::new(),
            tls_client_key_file: String::new(),
            tls_ca_cert_file: String::new(),
            reply_timeout_secs: crate::broker::options::DEFAULT_REPLY_TIMEOUT.as_secs(),
        }
    }
}

impl std::fmt::Debug for KafkaBrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBrokerConfig")
            .field("addresses", &self.addresses)
            .field("sasl_enabled", &self.sasl_enabled)
            .field("sasl_user", &self.sasl_user)
            .field("sasl_algorithm", &self.sasl_algorithm)
            .field("tls_enabled", &self.tls_enabled)
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("tls_client_cert_file", &self.tls_client_cert_file)
            .field("tls_client_key_file", &self.tls_client_key_file)
            .field("tls_ca_cert_file", &self.tls_ca_cert_file)
            .field("reply_timeout_secs", &self.reply_timeout_secs)
            .finish()
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl KafkaBrokerConfig {
    /// Convert to broker options.
    ///
    /// TLS file existence is checked when the broker connects.
    pub fn to_broker_options(&self) -> Result<BrokerOptions, ConfigError> {
        let mut options = BrokerOptions::default().with_addresses(self.addresses.iter().cloned());
        if self.reply_timeout_secs > 0 {
            options = options.with_reply_timeout(Duration::from_secs(self.reply_timeout_secs));
        }

        if self.sasl_enabled {
            if self.sasl_user.is_empty() {
                return Err(ConfigError::MissingSaslUser);
            }
            let algorithm: SaslAlgorithm = self.sasl_algorithm.parse()?;
            options = options.with_sasl(SaslOptions {
                username: self.sasl_user.clone(),
                password: self.sasl_password.clone(),
                mechanism: algorithm.into(),
            });
        }

        if self.tls_enabled {
            options = options.with_tls(TlsOptions {
                client_cert_file: non_empty_path(&self.tls_client_cert_file),
                client_key_file: non_empty_path(&self.tls_client_key_file),
                ca_cert_file: non_empty_path(&self.tls_ca_cert_file),
                skip_verify: self.tls_skip_verify,
            });
        }

        Ok(options)
    }
}
