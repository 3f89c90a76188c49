//! Environment-driven configuration

use crate::llm::LlmConfig;
use crate::runtime::DEFAULT_MAX_ROUNDS;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_PORT: u16 = 8000;

/// Cluster API connection used by the cluster tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub api_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub max_rounds: usize,
    pub llm: LlmConfig,
    /// `None` leaves the cluster tools unregistered
    pub cluster: Option<ClusterConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = get("KUBE_ASSIST_DB_PATH").map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.kube-assist/assist.db"))
            },
            PathBuf::from,
        );

        let cluster = get("KUBE_API_URL").map(|api_url| ClusterConfig {
            api_url,
            token: get("KUBE_TOKEN"),
        });

        Self {
            db_path,
            port: parse_or(get("KUBE_ASSIST_PORT"), "KUBE_ASSIST_PORT", DEFAULT_PORT),
            max_rounds: parse_or(
                get("KUBE_ASSIST_MAX_ROUNDS"),
                "KUBE_ASSIST_MAX_ROUNDS",
                DEFAULT_MAX_ROUNDS,
            )
            .max(1),
            llm: LlmConfig::from_lookup(&lookup),
            cluster,
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, default = %default, "Invalid setting, using default");
            default
        }),
    }
}
