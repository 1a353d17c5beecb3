//! Webhook destination validation.
//!
//! Every outbound notification URL is checked before every attempt:
//! https only, the host must match the channel's allow-list, and neither
//! a literal IP nor any resolved address may land in a private, loopback,
//! link-local, or metadata range. A task that fails here is a
//! configuration error, not a retryable delivery failure.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use ipnet::{Ipv4Net, Ipv6Net};
use ledger_core::ChannelKind;
use url::Url;

const METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.internal",
];

const BLOCKED_IPV4_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "0.0.0.0/8",
];

const BLOCKED_IPV6_CIDRS: &[&str] = &["::1/128", "fe80::/10", "fc00::/7"];

#[derive(Debug, thiserror::Error)]
pub enum SsrfRejected {
    #[error("invalid webhook URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("webhook must use https, got {scheme:?}")]
    NotHttps { scheme: String },

    #[error("host {host:?} is not allowed for {channel} webhooks")]
    HostNotAllowed { channel: &'static str, host: String },

    #[error("path {path:?} is not a valid {channel} webhook path")]
    PathNotAllowed { channel: &'static str, path: String },

    #[error("blocked metadata endpoint {host}")]
    MetadataEndpoint { host: String },

    #[error("blocked private address {ip} for host {host}")]
    PrivateAddress { ip: IpAddr, host: String },
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => {
            if is_blocked_ipv6(v6) {
                return true;
            }
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ipv4(mapped);
            }
            false
        }
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    BLOCKED_IPV4_CIDRS
        .iter()
        .filter_map(|cidr| cidr.parse::<Ipv4Net>().ok())
        .any(|net| net.contains(&ip))
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    BLOCKED_IPV6_CIDRS
        .iter()
        .filter_map(|cidr| cidr.parse::<Ipv6Net>().ok())
        .any(|net| net.contains(&ip))
}

/// Validate a webhook destination for a channel. Email recipients are
/// addresses, not URLs; their fixed SendGrid endpoint is validated by
/// construction in the sender, so email passes through here.
pub fn validate(channel: ChannelKind, url_str: &str) -> Result<(), SsrfRejected> {
    if channel == ChannelKind::Email {
        return Ok(());
    }

    let parsed = Url::parse(url_str).map_err(|err| SsrfRejected::InvalidUrl {
        url: url_str.to_string(),
        reason: err.to_string(),
    })?;

    if parsed.scheme() != "https" {
        return Err(SsrfRejected::NotHttps {
            scheme: parsed.scheme().to_string(),
        });
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| SsrfRejected::InvalidUrl {
            url: url_str.to_string(),
            reason: "URL has no host".to_string(),
        })?
        .to_ascii_lowercase();

    if METADATA_HOSTS.iter().any(|&m| m == host) {
        return Err(SsrfRejected::MetadataEndpoint { host });
    }

    // A literal-IP host is checked before any allow-list logic; the
    // chat-channel allow-lists are hostname-only anyway.
    if let Some(ip) = literal_ip(&parsed) {
        if is_blocked_ip(ip) {
            return Err(SsrfRejected::PrivateAddress { ip, host });
        }
    }

    let path = parsed.path();
    match channel {
        ChannelKind::Email => unreachable!("handled above"),
        ChannelKind::Slack => {
            require_host(channel, &host, host == "hooks.slack.com")?;
            require_path(channel, path, path.starts_with("/services/"))?;
        }
        ChannelKind::Discord => {
            require_host(
                channel,
                &host,
                host == "discord.com" || host == "discordapp.com",
            )?;
            require_path(channel, path, path.starts_with("/api/webhooks/"))?;
        }
        ChannelKind::Teams => {
            // Tenant-specific host like contoso.webhook.office.com; the
            // bare domain carries no tenant and is rejected.
            let allowed = host
                .strip_suffix(".webhook.office.com")
                .is_some_and(|tenant| !tenant.is_empty() && !tenant.contains('.'));
            require_host(channel, &host, allowed)?;
        }
        ChannelKind::Webhook => {
            resolve_and_check(&parsed, &host)?;
        }
    }

    Ok(())
}

fn require_host(channel: ChannelKind, host: &str, allowed: bool) -> Result<(), SsrfRejected> {
    if allowed {
        Ok(())
    } else {
        Err(SsrfRejected::HostNotAllowed {
            channel: channel.as_str(),
            host: host.to_string(),
        })
    }
}

fn require_path(channel: ChannelKind, path: &str, allowed: bool) -> Result<(), SsrfRejected> {
    if allowed {
        Ok(())
    } else {
        Err(SsrfRejected::PathNotAllowed {
            channel: channel.as_str(),
            path: path.to_string(),
        })
    }
}

fn literal_ip(parsed: &Url) -> Option<IpAddr> {
    match parsed.host()? {
        url::Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        url::Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
        url::Host::Domain(_) => None,
    }
}

/// Best-effort DNS check for generic webhook hosts. Resolution failure is
/// not a rejection; the HTTP client will surface an unresolvable host.
fn resolve_and_check(parsed: &Url, host: &str) -> Result<(), SsrfRejected> {
    if literal_ip(parsed).is_some() {
        return Ok(()); // literal IP already checked
    }
    let port = parsed.port_or_known_default().unwrap_or(443);
    if let Ok(addrs) = format!("{host}:{port}").to_socket_addrs() {
        for addr in addrs {
            if is_blocked_ip(addr.ip()) {
                return Err(SsrfRejected::PrivateAddress {
                    ip: addr.ip(),
                    host: host.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_hook_on_the_official_host_passes() {
        assert!(validate(
            ChannelKind::Slack,
            "https://hooks.slack.com/services/T0001/B0001/XXXX"
        )
        .is_ok());
    }

    #[test]
    fn slack_rejects_wrong_host_and_wrong_path() {
        let err = validate(ChannelKind::Slack, "https://hooks.slack.com.evil.io/services/x")
            .unwrap_err();
        assert!(matches!(err, SsrfRejected::HostNotAllowed { .. }));

        let err = validate(ChannelKind::Slack, "https://hooks.slack.com/api/other").unwrap_err();
        assert!(matches!(err, SsrfRejected::PathNotAllowed { .. }));
    }

    #[test]
    fn discord_accepts_both_official_domains() {
        assert!(validate(
            ChannelKind::Discord,
            "https://discord.com/api/webhooks/123/token"
        )
        .is_ok());
        assert!(validate(
            ChannelKind::Discord,
            "https://discordapp.com/api/webhooks/123/token"
        )
        .is_ok());
        assert!(validate(ChannelKind::Discord, "https://discord.com/api/other").is_err());
    }

    #[test]
    fn teams_requires_a_tenant_subdomain() {
        assert!(validate(
            ChannelKind::Teams,
            "https://contoso.webhook.office.com/webhookb2/x"
        )
        .is_ok());
        assert!(validate(ChannelKind::Teams, "https://webhook.office.com/webhookb2/x").is_err());
        assert!(validate(ChannelKind::Teams, "https://evil.com/webhookb2/x").is_err());
    }

    #[test]
    fn http_is_rejected_for_every_url_channel() {
        for channel in [
            ChannelKind::Slack,
            ChannelKind::Discord,
            ChannelKind::Teams,
            ChannelKind::Webhook,
        ] {
            let err = validate(channel, "http://example.com/hook").unwrap_err();
            assert!(matches!(err, SsrfRejected::NotHttps { .. }), "{channel:?}");
        }
    }

    #[test]
    fn loopback_and_private_literals_are_rejected() {
        for url in [
            "https://127.0.0.1/hook",
            "https://10.0.0.1/hook",
            "https://192.168.1.10/hook",
            "https://169.254.169.254/latest/meta-data/",
            "https://[::1]/hook",
            "https://[::ffff:10.0.0.1]/hook",
        ] {
            assert!(validate(ChannelKind::Webhook, url).is_err(), "{url}");
        }
    }

    #[test]
    fn metadata_hostname_is_rejected() {
        let err = validate(ChannelKind::Webhook, "https://metadata.google.internal/x").unwrap_err();
        assert!(matches!(err, SsrfRejected::MetadataEndpoint { .. }));
    }

    #[test]
    fn email_recipients_are_not_urls() {
        assert!(validate(ChannelKind::Email, "ops@example.com").is_ok());
    }

    #[test]
    fn blocked_ip_ranges() {
        assert!(is_blocked_ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_blocked_ip(IpAddr::V4(Ipv4Addr::new(172, 16, 5, 1))));
        assert!(is_blocked_ip(IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1))));
        assert!(is_blocked_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_blocked_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }
}
