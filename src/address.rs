//! Address string parsing: `[scheme://]host[:port][/path][;params][?query][#frag]`,
//! with a bare `/...` path treated as a UNIX-domain socket path.
//!
//! Not the `url` crate: matrix parameters (`;k=v` segments) aren't part of
//! the `url` crate's model.

use crate::value::OrderedMap;

/// A parsed address. `unix` is set when the address names a UNIX-domain
/// socket path rather than a host/port pair; `service` mirrors `port` as a
/// string for APIs that want a service name (e.g. `getaddrinfo`-style calls).
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub scheme: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub params: OrderedMap,
    pub query: OrderedMap,
    pub fragment: Option<String>,
    pub unix: Option<String>,
}

impl Address {
    pub fn service(&self) -> Option<String> {
        self.port.map(|p| p.to_string())
    }

    /// Parses `s` into an [`Address`]. Never fails: malformed pieces are
    /// treated as best-effort literal text, matching the tolerant parsing
    /// style of the rest of the wire layer.
    pub fn parse(s: &str) -> Address {
        if s.starts_with('/') && !s.contains("://") {
            let (path, fragment) = split_fragment(s);
            let (path, query) = split_query(&path);
            let (path, params) = split_params(&path);
            return Address {
                scheme: None,
                host: String::new(),
                port: None,
                path: path.clone(),
                params,
                query,
                fragment,
                unix: Some(path),
            };
        }

        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_string()), rest),
            None => (None, s),
        };

        let (authority, path_and_rest) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(p) => (h.to_string(), Some(p)),
                Err(_) => (authority.to_string(), None),
            },
            None => (authority.to_string(), None),
        };

        let (path_and_rest, fragment) = split_fragment(path_and_rest);
        let (path_and_rest, query) = split_query(&path_and_rest);
        let (path, params) = split_params(&path_and_rest);

        Address { scheme, host, port, path, params, query, fragment, unix: None }
    }
}

fn split_fragment(s: &str) -> (String, Option<String>) {
    match s.split_once('#') {
        Some((head, frag)) => (head.to_string(), Some(frag.to_string())),
        None => (s.to_string(), None),
    }
}

fn split_query(s: &str) -> (String, OrderedMap) {
    match s.split_once('?') {
        Some((head, qs)) => (head.to_string(), parse_kv_pairs(qs, '&')),
        None => (s.to_string(), OrderedMap::new()),
    }
}

fn split_params(s: &str) -> (String, OrderedMap) {
    match s.split_once(';') {
        Some((head, ps)) => (head.to_string(), parse_kv_pairs(ps, ';')),
        None => (s.to_string(), OrderedMap::new()),
    }
}

fn parse_kv_pairs(s: &str, sep: char) -> OrderedMap {
    let mut map = OrderedMap::new();
    for pair in s.split(sep) {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => map.insert(k.to_string(), crate::value::Value::str(v)),
            None => map.insert(pair.to_string(), crate::value::Value::None),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_slash_path_is_a_unix_socket() {
        let a = Address::parse("/tmp/app.sock");
        assert_eq!(a.unix.as_deref(), Some("/tmp/app.sock"));
        assert_eq!(a.path, "/tmp/app.sock");
    }

    #[test]
    fn scheme_host_port_path_parse() {
        let a = Address::parse("ws://example.com:8080/chat");
        assert_eq!(a.scheme.as_deref(), Some("ws"));
        assert_eq!(a.host, "example.com");
        assert_eq!(a.port, Some(8080));
        assert_eq!(a.path, "/chat");
        assert_eq!(a.unix, None);
    }

    #[test]
    fn matrix_params_and_query_and_fragment() {
        let a = Address::parse("ws://host/path;v=2?x=1&y=2#top");
        assert_eq!(a.path, "/path");
        assert_eq!(a.params.get("v").and_then(|v| v.as_str()), Some("2"));
        assert_eq!(a.query.get("x").and_then(|v| v.as_str()), Some("1"));
        assert_eq!(a.fragment.as_deref(), Some("top"));
    }

    #[test]
    fn host_without_scheme_or_port() {
        let a = Address::parse("localhost");
        assert_eq!(a.host, "localhost");
        assert_eq!(a.port, None);
        assert_eq!(a.unix, None);
    }
}
