//! # Endpoint Candidates
//!
//! Local DDEV stacks expose Reverb and the auth route behind Traefik on
//! non-standard ports. When a configured URL points at a `*.ddev.site` host
//! without an explicit port, the session also tries the usual router ports
//! before giving up.

use url::Url;

const DDEV_SUFFIX: &str = ".ddev.site";
const DDEV_HTTP_PORT: u16 = 8080;
const DDEV_HTTPS_PORT: u16 = 8443;

/// WebSocket URLs to try, in order: the configured URL, then
/// `ws://host:8080` and `wss://host:8443` for DDEV hosts.
pub fn ws_candidates(url: &str) -> Vec<String> {
    candidates(url, ("ws", "wss"))
}

/// Auth URLs to try, in order: the configured URL, then
/// `http://host:8080` and `https://host:8443` for DDEV hosts.
pub fn auth_candidates(url: &str) -> Vec<String> {
    candidates(url, ("http", "https"))
}

fn candidates(url: &str, (plain, tls): (&str, &str)) -> Vec<String> {
    let mut out = vec![url.to_string()];
    let Ok(parsed) = Url::parse(url) else {
        return out;
    };
    let is_ddev = parsed
        .host_str()
        .is_some_and(|host| host.ends_with(DDEV_SUFFIX));
    if !is_ddev || parsed.port().is_some() {
        return out;
    }

    for (scheme, port) in [(plain, DDEV_HTTP_PORT), (tls, DDEV_HTTPS_PORT)] {
        let mut alt = parsed.clone();
        // Both schemes of a pair are "special", so the switch cannot fail.
        if alt.set_scheme(scheme).is_err() || alt.set_port(Some(port)).is_err() {
            continue;
        }
        let alt = alt.to_string();
        if !out.contains(&alt) {
            out.push(alt);
        }
    }
    out
}
