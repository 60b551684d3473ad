use std::{net::IpAddr, time::Duration};

use crate::infragate::{error::GatewayError, router::RoutingKey, status::ServerStatus};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// A routable backend server.
///
/// Immutable once registered; a configuration change registers a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: String,
    /// Lowercased, trimmed, de-duplicated virtual hosts.
    pub domains: Vec<String>,
    pub listen_addr: String,
    /// Dial target (`host:port`).
    pub address: String,
    pub dial_timeout: Duration,
    pub proxy_bind: Option<IpAddr>,
    pub send_proxy_protocol: bool,
    pub send_real_ip: bool,
    pub disconnect_message: Option<String>,
    pub online_status: Option<ServerStatus>,
    pub offline_status: Option<ServerStatus>,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        domains: impl IntoIterator<Item = impl AsRef<str>>,
        listen_addr: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let mut out: Vec<String> = Vec::new();
        for d in domains {
            let d = d.as_ref().trim().trim_matches('.').to_ascii_lowercase();
            if !out.contains(&d) {
                out.push(d);
            }
        }
        Self {
            id: id.into(),
            domains: out,
            listen_addr: listen_addr.into().trim().to_string(),
            address: address.into().trim().to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            proxy_bind: None,
            send_proxy_protocol: false,
            send_real_ip: false,
            disconnect_message: None,
            online_status: None,
            offline_status: None,
        }
    }

    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        self.domains
            .iter()
            .map(|d| RoutingKey::new(d, &self.listen_addr))
            .collect()
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::InvalidBackend("empty id".into()));
        }
        if self.listen_addr.is_empty() {
            return Err(GatewayError::InvalidBackend(format!(
                "{}: empty listen address",
                self.id
            )));
        }
        if self.address.is_empty() {
            return Err(GatewayError::InvalidBackend(format!(
                "{}: empty address",
                self.id
            )));
        }
        if self.domains.is_empty() {
            return Err(GatewayError::InvalidBackend(format!(
                "{}: no domains",
                self.id
            )));
        }
        for d in &self.domains {
            if d.is_empty() {
                return Err(GatewayError::InvalidBackend(format!(
                    "{}: empty domain",
                    self.id
                )));
            }
            if d.contains(['*', '?']) {
                return Err(GatewayError::InvalidBackend(format!(
                    "{}: wildcard domain {d:?} is not supported",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_are_normalized_and_deduplicated() {
        let b = Backend::new(
            "lobby",
            [" Lobby.Example.com ", "lobby.example.com.", "alt.example.com"],
            ":25565",
            "10.0.0.2:25565",
        );
        assert_eq!(b.domains, vec!["lobby.example.com", "alt.example.com"]);
        let keys: Vec<String> = b.routing_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(
            keys,
            vec!["lobby.example.com@:25565", "alt.example.com@:25565"]
        );
        assert!(b.validate().is_ok());
    }

    #[test]
    fn validate_rejects_wildcards_and_empty_fields() {
        let b = Backend::new("w", ["*.example.com"], ":25565", "10.0.0.2:25565");
        assert!(matches!(b.validate(), Err(GatewayError::InvalidBackend(_))));

        let b = Backend::new("e", Vec::<String>::new(), ":25565", "10.0.0.2:25565");
        assert!(b.validate().is_err());

        let b = Backend::new("a", ["a.test"], ":25565", "");
        assert!(b.validate().is_err());
    }
}
