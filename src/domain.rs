use anyhow::Result;
use publicsuffix::{List, Psl};
use url::Url;

/// Extracts the registrable domain from a URL using the Public Suffix List.
///
/// Hosts that are not under a public suffix (IP literals, bare hostnames on
/// private networks) fall back to the host string itself so rate discipline
/// and learning still key off something stable.
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed or has no host.
pub fn registrable_domain(list: &List, url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    let host = match parsed.host() {
        // IP literals never have a registrable domain.
        Some(url::Host::Ipv4(ip)) => return Ok(ip.to_string()),
        Some(url::Host::Ipv6(ip)) => return Ok(ip.to_string()),
        Some(url::Host::Domain(host)) => host,
        None => anyhow::bail!("No host in {url}"),
    };
    match list.domain(host.as_bytes()) {
        Some(d) => Ok(String::from_utf8_lossy(d.as_bytes()).to_string()),
        None => Ok(host.to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_subdomains() {
        let list = List::new();
        let domain = registrable_domain(&list, "https://www.example.com/path?q=1").unwrap();
        assert_eq!(domain, "example.com");
    }

    #[test]
    fn ip_hosts_fall_back_to_the_literal() {
        let list = List::new();
        let domain = registrable_domain(&list, "http://127.0.0.1:8080/").unwrap();
        assert_eq!(domain, "127.0.0.1");
    }

    #[test]
    fn mailto_has_no_host() {
        let list = List::new();
        assert!(registrable_domain(&list, "mailto:someone@example.com").is_err());
    }
}
