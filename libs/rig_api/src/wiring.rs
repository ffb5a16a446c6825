//! Resolved endpoints and the wiring context handed to services and
//! hooks, plus the environment-variable rendering rules that every
//! consumer (daemon, SDK, user binaries) must agree on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::spec::Protocol;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Endpoint {
            host: host.into(),
            port,
            protocol,
            attributes: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything a service or hook needs to talk to its world. Init hooks
/// receive a context whose `egresses` map is deliberately empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WiringContext {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ingresses: BTreeMap<String, Endpoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub egresses: BTreeMap<String, Endpoint>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub temp_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// The default (single, unnamed) ingress goes by this name and renders
/// its variables unprefixed.
pub const DEFAULT_INGRESS: &str = "default";

fn env_prefix(name: &str) -> String {
    let mut prefix = name.to_uppercase().replace('-', "_");
    prefix.push('_');
    prefix
}

fn attribute_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_endpoint(out: &mut BTreeMap<String, String>, prefix: &str, endpoint: &Endpoint) {
    out.insert(format!("{prefix}HOST"), endpoint.host.clone());
    out.insert(format!("{prefix}PORT"), endpoint.port.to_string());
    for (key, value) in &endpoint.attributes {
        let key = key.to_uppercase().replace('-', "_");
        out.insert(format!("{prefix}{key}"), attribute_value(value));
    }
}

impl WiringContext {
    /// Render the flat environment-variable map for a service start:
    /// `RIG_WIRING` (the whole context as JSON) plus the flat fallbacks.
    ///
    /// The default ingress is unprefixed; named ingresses are prefixed
    /// `NAME_` (uppercased, `-` -> `_`); egresses are always prefixed by
    /// their local name. Endpoint attributes are merged with the same
    /// prefix rules.
    pub fn env_map(&self, service: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        for (name, endpoint) in &self.ingresses {
            let prefix = if name == DEFAULT_INGRESS {
                String::new()
            } else {
                env_prefix(name)
            };
            render_endpoint(&mut out, &prefix, endpoint);
        }
        for (name, endpoint) in &self.egresses {
            render_endpoint(&mut out, &env_prefix(name), endpoint);
        }
        for (key, value) in &self.attributes {
            out.insert(key.clone(), value.clone());
        }

        // The structured form wins over any flat key it collides with.
        if let Ok(json) = serde_json::to_string(self) {
            out.insert("RIG_WIRING".to_string(), json);
        }
        out.insert("RIG_SERVICE".to_string(), service.to_string());
        out.insert("RIG_TEMP_DIR".to_string(), self.temp_dir.clone());
        out.insert("RIG_ENV_DIR".to_string(), self.env_dir.clone());

        out
    }

    /// A copy with egresses stripped, for init hooks.
    pub fn ingresses_only(&self) -> WiringContext {
        WiringContext {
            ingresses: self.ingresses.clone(),
            egresses: BTreeMap::new(),
            temp_dir: self.temp_dir.clone(),
            env_dir: self.env_dir.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Expand `$VAR` and `${VAR}` references against `vars`. Unknown
/// variables expand to the empty string; `$$` is not special.
pub fn expand_templates(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    if let Some(value) = vars.get(&name) {
                        out.push_str(value);
                    }
                } else {
                    // Unterminated ${...}: keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(value) = vars.get(&name) {
                    out.push_str(value);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiring() -> WiringContext {
        let mut ingresses = BTreeMap::new();
        let mut default = Endpoint::new("127.0.0.1", 8080, Protocol::Http);
        default
            .attributes
            .insert("base-url".to_string(), "http://127.0.0.1:8080".into());
        ingresses.insert(DEFAULT_INGRESS.to_string(), default);
        ingresses.insert(
            "metrics".to_string(),
            Endpoint::new("127.0.0.1", 9090, Protocol::Http),
        );

        let mut egresses = BTreeMap::new();
        let mut db = Endpoint::new("127.0.0.1", 5001, Protocol::Tcp);
        db.attributes.insert("PGHOST".to_string(), "127.0.0.1".into());
        db.attributes.insert("PGPORT".to_string(), 5001.into());
        egresses.insert("database".to_string(), db);

        WiringContext {
            ingresses,
            egresses,
            temp_dir: "/tmp/env/svc".to_string(),
            env_dir: "/tmp/env".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn env_map_prefix_rules() {
        let map = wiring().env_map("api");
        assert_eq!(map["HOST"], "127.0.0.1");
        assert_eq!(map["PORT"], "8080");
        assert_eq!(map["BASE_URL"], "http://127.0.0.1:8080");
        assert_eq!(map["METRICS_PORT"], "9090");
        assert_eq!(map["DATABASE_HOST"], "127.0.0.1");
        assert_eq!(map["DATABASE_PORT"], "5001");
        assert_eq!(map["DATABASE_PGHOST"], "127.0.0.1");
        assert_eq!(map["DATABASE_PGPORT"], "5001");
        assert_eq!(map["RIG_SERVICE"], "api");
        assert_eq!(map["RIG_ENV_DIR"], "/tmp/env");
        assert_eq!(map["RIG_TEMP_DIR"], "/tmp/env/svc");

        let parsed: WiringContext = serde_json::from_str(&map["RIG_WIRING"]).unwrap();
        assert_eq!(parsed.egresses["database"].port, 5001);
    }

    #[test]
    fn init_wiring_has_no_egresses() {
        let init = wiring().ingresses_only();
        assert!(init.egresses.is_empty());
        assert_eq!(init.ingresses.len(), 2);
    }

    #[test]
    fn template_expansion() {
        let mut vars = BTreeMap::new();
        vars.insert("HOST".to_string(), "127.0.0.1".to_string());
        vars.insert("PORT".to_string(), "5432".to_string());

        assert_eq!(
            expand_templates("postgres://$HOST:${PORT}/app", &vars),
            "postgres://127.0.0.1:5432/app"
        );
        assert_eq!(expand_templates("$MISSING/x", &vars), "/x");
        assert_eq!(expand_templates("100$", &vars), "100$");
        assert_eq!(expand_templates("${UNTERMINATED", &vars), "${UNTERMINATED");
    }
}
