use colored::*;
use eyre::Result;

use crate::cli::{ConfigAction, OutputFormat};
use poe::config::Config;

pub fn run(action: ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show { format } => show(OutputFormat::resolve(format), config),
        ConfigAction::Get { key } => get(&key, config),
    }
}

fn show(format: OutputFormat, config: &Config) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(config)?);
        }
        OutputFormat::Text => {
            println!("{}", "PoE Configuration".bold());
            println!();

            println!("{}:", "sidecar".cyan());
            println!("  url: {}", config.sidecar.url);
            println!("  connect_timeout_ms: {}", config.sidecar.connect_timeout_ms);
            println!("  deadline_ms: {}", config.sidecar.deadline_ms);
            println!("  release_timeout_ms: {}", display_opt(config.sidecar.release_timeout_ms));
            println!("  field_case: {:?}", config.sidecar.field_case);
            println!();

            let identity = &config.identity;
            println!("{}:", "identity".cyan());
            println!("  service_name: {}", identity.service_name);
            println!("  service_namespace: {}", display_opt(identity.service_namespace.as_ref()));
            println!("  pod_name: {}", display_opt(identity.pod_name.as_ref()));
            println!("  pod_uid: {}", display_opt(identity.pod_uid.as_ref()));
            println!("  image_digest: {}", display_opt(identity.image_digest.as_ref()));
            println!("  code_version: {}", display_opt(identity.code_version.as_ref()));
            println!("  code_hash: {}", display_opt(identity.code_hash.as_ref()));
            println!();

            println!("log_level: {}", config.log_level.as_filter());
        }
    }

    Ok(())
}

fn display_opt<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".dimmed().to_string())
}

fn lookup(key: &str, config: &Config) -> Option<String> {
    let identity = &config.identity;
    let optional = |v: &Option<String>| v.clone().unwrap_or_default();

    match key {
        "sidecar.url" => Some(config.sidecar.url.clone()),
        "sidecar.connect_timeout_ms" => Some(config.sidecar.connect_timeout_ms.to_string()),
        "sidecar.deadline_ms" => Some(config.sidecar.deadline_ms.to_string()),
        "sidecar.release_timeout_ms" => Some(
            config
                .sidecar
                .release_timeout_ms
                .map(|ms| ms.to_string())
                .unwrap_or_default(),
        ),
        "identity.service_name" => Some(identity.service_name.clone()),
        "identity.service_namespace" => Some(optional(&identity.service_namespace)),
        "identity.pod_name" => Some(optional(&identity.pod_name)),
        "identity.pod_uid" => Some(optional(&identity.pod_uid)),
        "identity.image_digest" => Some(optional(&identity.image_digest)),
        "identity.code_version" => Some(optional(&identity.code_version)),
        "identity.code_hash" => Some(optional(&identity.code_hash)),
        "log_level" | "log-level" => Some(config.log_level.as_filter().to_string()),
        _ => None,
    }
}

fn get(key: &str, config: &Config) -> Result<()> {
    match lookup(key, config) {
        Some(v) => println!("{}", v),
        None => eyre::bail!("Unknown config key: {}", key),
    }

    Ok(())
}
