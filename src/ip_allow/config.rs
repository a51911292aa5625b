//! Configuration loading for [`super::IpAllow`]: a legacy flat line format
//! and a structured YAML format. Either format builds the same
//! intermediate [`IpAllowBuild`], which is then frozen into an
//! [`super::IpAllow`] generation and swapped in atomically by the caller —
//! loading itself never mutates a live configuration.

use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_with::{serde_as, OneOrMany};

use crate::error::LoomError;
use crate::header::{WksMethod, ALL_METHOD_MASK};

use super::{IpMap, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Allow,
    Deny,
}

impl Action {
    fn parse(s: &str) -> Result<Self, LoomError> {
        match s.to_ascii_lowercase().as_str() {
            "allow" | "ip_allow" => Ok(Action::Allow),
            "deny" | "ip_deny" => Ok(Action::Deny),
            other => Err(LoomError::config(format!("ip_allow: unknown action `{other}`"))),
        }
    }
}

/// Intermediate representation built while parsing either config format.
/// `build()` freezes this into a ready-to-swap [`super::IpAllow`].
#[derive(Debug, Default)]
pub struct IpAllowBuild {
    src: IpMap,
    dst: IpMap,
}

impl IpAllowBuild {
    pub fn build(self) -> super::IpAllow {
        super::IpAllow::new(self.src, self.dst)
    }

    fn push(&mut self, key: super::MatchKey, network: IpNetwork, record: Record) {
        let record = Arc::new(record);
        match key {
            super::MatchKey::Src => self.src.insert(network, record),
            super::MatchKey::Dst => self.dst.insert(network, record),
        }
    }
}

/// Builds a `Record` from a parsed action and method list. `deny` is
/// expressed as the complement of the listed well-known methods with
/// `deny_nonstandard = true`; `allow` is the listed methods as-is with
/// `deny_nonstandard = false`.
fn build_record(action: Action, methods: &[String], source_line: u32) -> Record {
    let mut wks_mask = 0u32;
    let mut nonstandard = Vec::new();
    for m in methods {
        if m.eq_ignore_ascii_case("all") {
            wks_mask = ALL_METHOD_MASK;
        } else if let Some(wks) = WksMethod::from_str(m) {
            wks_mask |= wks.mask();
        } else {
            nonstandard.push(m.clone());
        }
    }

    match action {
        Action::Allow => Record { method_mask: wks_mask, nonstandard, deny_nonstandard: false, source_line },
        Action::Deny => Record {
            method_mask: ALL_METHOD_MASK & !wks_mask,
            nonstandard,
            deny_nonstandard: true,
            source_line,
        },
    }
}

fn parse_network(spec: &str) -> Result<IpNetwork, LoomError> {
    if let Ok(net) = IpNetwork::from_str(spec) {
        return Ok(net);
    }
    // Bare address with no prefix: treat as a host route.
    let addr: std::net::IpAddr = spec
        .parse()
        .map_err(|_| LoomError::config(format!("ip_allow: invalid address/range `{spec}`")))?;
    let bits = if addr.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(addr, bits).map_err(|_| LoomError::config(format!("ip_allow: invalid address `{spec}`")))
}

/// Parses the legacy flat format: one rule per line,
/// `src_ip=<range> action=<allow|deny> method=<all|CSV>` (or `dest_ip=`).
/// Any parse error discards the whole file — the caller keeps serving the
/// prior generation.
pub fn load_legacy(text: &str) -> Result<IpAllowBuild, LoomError> {
    let mut build = IpAllowBuild::default();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut key: Option<super::MatchKey> = None;
        let mut ip_spec: Option<&str> = None;
        let mut action: Option<Action> = None;
        let mut methods: Vec<String> = vec!["all".to_string()];

        for token in line.split_whitespace() {
            let (k, v) = token.split_once('=').ok_or_else(|| {
                LoomError::config(format!("ip_allow: malformed token `{token}` on line {line_no}"))
            })?;
            match k {
                "src_ip" => {
                    key = Some(super::MatchKey::Src);
                    ip_spec = Some(v);
                }
                "dest_ip" => {
                    key = Some(super::MatchKey::Dst);
                    ip_spec = Some(v);
                }
                "action" => action = Some(Action::parse(v)?),
                "method" => methods = v.split(',').map(|s| s.trim().to_string()).collect(),
                other => {
                    return Err(LoomError::config(format!(
                        "ip_allow: unknown key `{other}` on line {line_no}"
                    )))
                }
            }
        }

        let key = key.ok_or_else(|| LoomError::config(format!("ip_allow: missing src_ip/dest_ip on line {line_no}")))?;
        let ip_spec = ip_spec.expect("key implies ip_spec was set");
        let action = action.ok_or_else(|| LoomError::config(format!("ip_allow: missing action on line {line_no}")))?;
        let network = parse_network(ip_spec)?;
        let record = build_record(action, &methods, line_no);
        build.push(key, network, record);
    }

    Ok(build)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ApplyDirection {
    In,
    Out,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct YamlRule {
    apply: ApplyDirection,
    #[serde_as(as = "OneOrMany<_>")]
    ip_addrs: Vec<String>,
    action: String,
    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    methods: Option<Vec<String>>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct YamlDoc {
    #[serde_as(as = "OneOrMany<_>")]
    ip_allow: Vec<YamlRule>,
}

/// Parses the YAML format: a top-level `ip_allow:` sequence (or singleton)
/// of rule objects carrying `apply: in|out`, `ip_addrs`, `action`, and an
/// optional `methods` (defaulting to `all`).
pub fn load_yaml(text: &str) -> Result<IpAllowBuild, LoomError> {
    let doc: YamlDoc = serde_yaml::from_str(text)
        .map_err(|e| LoomError::config(format!("ip_allow: invalid yaml: {e}")))?;

    let mut build = IpAllowBuild::default();
    for (idx, rule) in doc.ip_allow.into_iter().enumerate() {
        let line_no = (idx + 1) as u32;
        let key = match rule.apply {
            ApplyDirection::In => super::MatchKey::Src,
            ApplyDirection::Out => super::MatchKey::Dst,
        };
        let action = Action::parse(&rule.action)?;
        let methods = rule.methods.unwrap_or_else(|| vec!["all".to_string()]);
        let record = build_record(action, &methods, line_no);
        for ip_spec in &rule.ip_addrs {
            let network = parse_network(ip_spec)?;
            build.push(key, network, record.clone());
        }
    }

    Ok(build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::WksMethod;

    #[test]
    fn legacy_allow_line_builds_src_map() {
        let build = load_legacy("src_ip=10.0.0.0/8 action=allow method=GET,HEAD\n").unwrap();
        let allow = build.build();
        let acl = allow.match_src("10.1.2.3".parse().unwrap());
        assert!(acl.is_method_allowed(WksMethod::Get));
        assert!(!acl.is_method_allowed(WksMethod::Post));
    }

    #[test]
    fn legacy_deny_defaults_to_all_methods() {
        let build = load_legacy("dest_ip=192.168.0.0/16 action=deny\n").unwrap();
        let allow = build.build();
        let acl = allow.match_dst("192.168.1.1".parse().unwrap());
        assert!(acl.is_deny_all());
    }

    #[test]
    fn legacy_rejects_malformed_token() {
        assert!(load_legacy("src_ip 10.0.0.0/8 action=allow\n").is_err());
    }

    #[test]
    fn legacy_comment_and_blank_lines_skipped() {
        let build = load_legacy("# comment\n\nsrc_ip=0.0.0.0/0 action=allow method=all\n").unwrap();
        let allow = build.build();
        assert!(allow.match_src("8.8.8.8".parse().unwrap()).is_allow_all());
    }

    #[test]
    fn yaml_singleton_rule() {
        let yaml = r#"
ip_allow:
  apply: in
  ip_addrs: 10.0.0.0/8
  action: allow
  methods: GET
"#;
        let build = load_yaml(yaml).unwrap();
        let allow = build.build();
        let acl = allow.match_src("10.0.0.1".parse().unwrap());
        assert!(acl.is_method_allowed(WksMethod::Get));
        assert!(!acl.is_method_allowed(WksMethod::Delete));
    }

    #[test]
    fn yaml_sequence_with_multiple_ip_addrs() {
        let yaml = r#"
ip_allow:
  - apply: out
    ip_addrs:
      - 172.16.0.0/12
      - 192.168.0.0/16
    action: deny
    methods:
      - PUT
      - DELETE
"#;
        let build = load_yaml(yaml).unwrap();
        let allow = build.build();
        let acl = allow.match_dst("192.168.5.5".parse().unwrap());
        assert!(!acl.is_method_allowed(WksMethod::Put));
        assert!(acl.is_method_allowed(WksMethod::Get));
    }

    #[test]
    fn yaml_missing_methods_defaults_to_all() {
        let yaml = r#"
ip_allow:
  apply: in
  ip_addrs: 0.0.0.0/0
  action: allow
"#;
        let build = load_yaml(yaml).unwrap();
        let allow = build.build();
        assert!(allow.match_src("1.2.3.4".parse().unwrap()).is_allow_all());
    }

    #[test]
    fn bad_yaml_is_rejected() {
        assert!(load_yaml("not: [valid, ip_allow").is_err());
    }
}
