//! Hosts that must never be intercepted.

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
  domain: String,
  subdomains_only: bool,
}

/// Hostnames tunnelled without TLS interception.
///
/// `example.com` matches the host itself and any subdomain such as
/// `api.example.com`, but not `notexample.com`. `*.example.com` matches
/// subdomains only. Comparison ignores case and a trailing dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList {
  rules: Vec<Rule>,
}

fn normalize(host: &str) -> String {
  host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl ExcludeList {
  /// Build from configuration entries. Blank entries are skipped.
  pub fn new<I, S>(entries: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let rules = entries
      .into_iter()
      .filter_map(|entry| {
        let entry = entry.as_ref().trim();
        let (domain, subdomains_only) = match entry.strip_prefix("*.") {
          Some(rest) => (rest, true),
          None => (entry, false),
        };
        let domain = normalize(domain.trim_start_matches('.'));
        (!domain.is_empty()).then_some(Rule {
          domain,
          subdomains_only,
        })
      })
      .collect();
    ExcludeList { rules }
  }

  /// Whether `host` must be tunnelled blind.
  pub fn matches(&self, host: &str) -> bool {
    let host = normalize(host);
    self.rules.iter().any(|rule| {
      let is_subdomain = host.len() > rule.domain.len()
        && host.ends_with(rule.domain.as_str())
        && host.as_bytes()[host.len() - rule.domain.len() - 1] == b'.';
      is_subdomain || (!rule.subdomains_only && host == rule.domain)
    })
  }

  /// Whether no rules are configured.
  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}
