//! Protocol discovery for scales: find the first catalog template whose
//! command/response/weight patterns validate against a live device.

use std::net::SocketAddr;
use std::time::Duration;

use acq_transport::{RawTcpConfig, RawTcpTransport};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::templates::ProtocolTemplate;

/// Sanity bounds a discovered weight reading must fall within to count as a
/// valid attempt, independent of whether a `response_pattern` also matched.
const WEIGHT_SANITY_RANGE: std::ops::RangeInclusive<f64> = -1000.0..=100_000.0;

/// Tunables for a discovery scan.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Attempts per template before deciding whether it validates.
    pub validation_readings: u32,
    /// Fraction of attempts that must be valid for a template to be accepted.
    pub valid_attempt_threshold: f64,
    /// Total time budget per template; divided evenly across attempts.
    pub template_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            validation_readings: 5,
            valid_attempt_threshold: 0.6,
            template_timeout: Duration::from_secs(5),
        }
    }
}

/// Walk `catalog` in order and return the first template that validates
/// against the device at `server_addr`, or `None` if cancelled or no
/// template matches.
pub async fn discover_protocol(
    server_addr: SocketAddr,
    catalog: &[ProtocolTemplate],
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Option<ProtocolTemplate> {
    for template in catalog {
        if cancel.is_cancelled() {
            return None;
        }
        if validates(server_addr, template, config, cancel).await {
            return Some(template.clone());
        }
    }
    None
}

async fn validates(
    server_addr: SocketAddr,
    template: &ProtocolTemplate,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> bool {
    let transport = RawTcpTransport::new(RawTcpConfig {
        server_addr,
        connection_cooldown: Duration::ZERO,
        ..RawTcpConfig::default()
    });

    if !transport.connect(cancel).await {
        return false;
    }

    let readings = config.validation_readings.max(1);
    let per_attempt_timeout = config.template_timeout / readings;

    let mut valid_attempts = 0u32;
    let mut total_attempts = 0u32;

    for _ in 0..readings {
        if cancel.is_cancelled() {
            break;
        }
        total_attempts += 1;
        if attempt_once(&transport, template, per_attempt_timeout, cancel).await {
            valid_attempts += 1;
        }
    }

    transport.disconnect().await;

    if total_attempts == 0 {
        return false;
    }
    f64::from(valid_attempts) / f64::from(total_attempts) >= config.valid_attempt_threshold
}

/// Iterate a template's commands until one produces a response that either
/// matches a `response_pattern` or yields a sane `weight_pattern` capture.
async fn attempt_once(
    transport: &RawTcpTransport,
    template: &ProtocolTemplate,
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    for command in &template.commands {
        let response = match transport.send_and_receive(command, timeout, cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(template = %template.id, error = %e, "discovery attempt failed");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&response);

        if template
            .response_patterns
            .iter()
            .any(|pattern| pattern.is_match(&text))
        {
            return true;
        }

        if let Some(caps) = template.weight_pattern.captures(&text) {
            if let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                if WEIGHT_SANITY_RANGE.contains(&value) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::builtin_templates;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn accepts_mettler_toledo_style_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                if socket
                                    .write_all(b"S S      +12.345 kg\r\n")
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let catalog = builtin_templates();
        let config = DiscoveryConfig {
            template_timeout: Duration::from_millis(500),
            ..DiscoveryConfig::default()
        };
        let cancel = CancellationToken::new();

        let found = discover_protocol(addr, &catalog, &config, &cancel).await;
        assert_eq!(found.unwrap().id, "mettler_toledo_continuous");
    }

    #[tokio::test]
    async fn falls_back_to_generic_template_for_unrecognized_dialect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                if socket.write_all(b"12.500 kg\r\n").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let catalog = builtin_templates();
        let config = DiscoveryConfig {
            template_timeout: Duration::from_millis(500),
            ..DiscoveryConfig::default()
        };
        let cancel = CancellationToken::new();

        let found = discover_protocol(addr, &catalog, &config, &cancel).await;
        assert_eq!(found.unwrap().id, "generic_decimal_weight");
    }

    #[tokio::test]
    async fn unreachable_device_matches_nothing() {
        let catalog = builtin_templates();
        let config = DiscoveryConfig {
            template_timeout: Duration::from_millis(200),
            ..DiscoveryConfig::default()
        };
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let found = discover_protocol(addr, &catalog, &config, &cancel).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_scan() {
        let catalog = builtin_templates();
        let config = DiscoveryConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let found = discover_protocol(addr, &catalog, &config, &cancel).await;
        assert!(found.is_none());
    }
}
