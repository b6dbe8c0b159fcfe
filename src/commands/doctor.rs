//! Diagnose PoE setup issues

use colored::*;
use eyre::{Result, eyre};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use poe::config::{Config, ENV_OVERRIDES};

pub fn run(config: &Config) -> Result<()> {
    println!("{}", "PoE Doctor".bold());
    println!("{}", "═".repeat(50));
    println!();

    let mut issues = 0;

    // Check config file
    let config_file = Config::poe_dir().join("poe.yaml");
    if config_file.exists() {
        println!("{} Config file: {}", "✓".green(), config_file.display());
    } else {
        println!("{} Config file missing: {} (using defaults)", "⚠".yellow(), config_file.display());
    }

    let overrides: Vec<&str> = ENV_OVERRIDES
        .iter()
        .copied()
        .filter(|key| std::env::var(key).is_ok_and(|v| !v.trim().is_empty()))
        .collect();
    if !overrides.is_empty() {
        println!("{} Environment overrides: {}", "✓".green(), overrides.join(", "));
    }

    println!();

    // Check identity
    println!("{}", "Identity:".bold());
    let identity = &config.identity;
    if identity.service_name.trim().is_empty() {
        println!("  {} service_name is empty", "✗".red());
        issues += 1;
    } else {
        println!("  {} service_name: {}", "✓".green(), identity.service_name);
    }

    for (name, value) in [
        ("service_namespace", &identity.service_namespace),
        ("pod_name", &identity.pod_name),
        ("pod_uid", &identity.pod_uid),
        ("image_digest", &identity.image_digest),
        ("code_version", &identity.code_version),
        ("code_hash", &identity.code_hash),
    ] {
        match value {
            Some(v) => println!("  {} {}: {}", "✓".green(), name, v),
            None => println!("  {} {}: {}", "⚠".yellow(), name, "not set (sent as null)".dimmed()),
        }
    }

    println!();

    // Check sidecar
    println!("{}", "Sidecar:".bold());
    println!("  URL: {}", config.sidecar.url);
    match resolve(&config.sidecar.url) {
        Ok(addr) => match TcpStream::connect_timeout(&addr, config.sidecar.connect_timeout()) {
            Ok(_) => println!("  {} Reachable at {}", "✓".green(), addr),
            Err(e) => {
                println!("  {} Cannot connect to {}: {}", "✗".red(), addr, e);
                issues += 1;
            }
        },
        Err(e) => {
            println!("  {} {}", "✗".red(), e);
            issues += 1;
        }
    }

    if config.sidecar.deadline() <= config.sidecar.connect_timeout() {
        println!(
            "  {} deadline ({:?}) is not longer than connect timeout ({:?}); most failures will log as timeouts",
            "⚠".yellow(),
            config.sidecar.deadline(),
            config.sidecar.connect_timeout()
        );
    }
    if config.sidecar.release_timeout().is_none() {
        println!(
            "  {} release_timeout_ms is unset; a silent sidecar keeps send threads alive",
            "⚠".yellow()
        );
    }

    println!();

    if issues == 0 {
        println!("{} All checks passed!", "✓".green().bold());
    } else {
        println!("{} {} issue(s) found", "⚠".yellow().bold(), issues);
    }

    Ok(())
}

/// Resolve the socket address of an http(s) URL
fn resolve(url: &str) -> Result<SocketAddr> {
    let uri: ureq::http::Uri = url.parse().map_err(|e| eyre!("Invalid sidecar URL {}: {}", url, e))?;

    let host = uri.host().ok_or_else(|| eyre!("Sidecar URL has no host: {}", url))?;
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("https")) => 443,
        (None, _) => 80,
    };

    // Bracketed IPv6 literals come back with their brackets
    let host = host.trim_start_matches('[').trim_end_matches(']');

    (host, port)
        .to_socket_addrs()
        .map_err(|e| eyre!("Cannot resolve {}: {}", host, e))?
        .next()
        .ok_or_else(|| eyre!("No addresses for {}", host))
}
