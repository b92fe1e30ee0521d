//! Request filters applied before authentication.

use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

static BOT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(bot|crawler|spider|crawling|slurp|facebookexternalhit|bingpreview|embedly|quora link preview|showyoubot|outbrain|pinterest|vkshare|w3c_validator|whatsapp|headlesschrome|lighthouse)",
    )
    .expect("bot pattern is a valid regex")
});

/// Whether a user agent belongs to a known crawler or link previewer.
#[must_use]
pub fn is_bot(user_agent: &str) -> bool {
    BOT_PATTERN.is_match(user_agent)
}

/// Folds IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4.
#[must_use]
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Whether `origin` may call a trigger with this allow-list. An empty list
/// allows everyone; a missing origin is never allowed by a non-empty list.
#[must_use]
pub fn origin_allowed(allow_list: &[IpAddr], origin: Option<IpAddr>) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    let Some(origin) = origin.map(normalize_ip) else {
        return false;
    };
    allow_list
        .iter()
        .any(|allowed| normalize_ip(*allowed) == origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn crawlers_are_detected() {
        assert!(is_bot("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        assert!(is_bot("facebookexternalhit/1.1"));
        assert!(is_bot("Slackbot-LinkExpanding 1.0"));
        assert!(!is_bot("curl/8.4.0"));
        assert!(!is_bot("GitHub-Hookshot/abc123"));
    }

    #[test]
    fn unlisted_origin_is_refused() {
        let allow: [IpAddr; 1] = ["10.0.0.1".parse().expect("ip")];
        assert!(!origin_allowed(&allow, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))));
        assert!(origin_allowed(&allow, Some("10.0.0.1".parse().expect("ip"))));
        assert!(!origin_allowed(&allow, None));
    }

    #[test]
    fn mapped_addresses_match_their_ipv4_form() {
        let allow: [IpAddr; 1] = ["10.0.0.1".parse().expect("ip")];
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        assert!(origin_allowed(&allow, Some(mapped)));
        assert!(!origin_allowed(&allow, Some(IpAddr::V6(Ipv6Addr::LOCALHOST))));
    }

    #[test]
    fn empty_list_allows_everyone() {
        assert!(origin_allowed(&[], None));
    }
}
