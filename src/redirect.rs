//! Redirect handling for the outbound client.

use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode, Uri};

/// Controls whether the client follows redirects.
///
/// - `none` returns every 3xx response as is. This is the default, so the
///   proxy relays exactly what the origin answered.
/// - `limited` follows up to the given number of hops in a chain.
/// - `custom` decides per hop with a function.
#[derive(Clone, Debug, PartialEq)]
pub enum Policy {
  /// Decide per hop, see [`Policy::custom`].
  Custom(fn(Attempt) -> Action),
  /// Follow at most this many hops.
  Limit(usize),
  /// Never follow.
  None,
}

/// The hop being considered.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempt<'a> {
  status: StatusCode,
  next: &'a Uri,
  previous: &'a [Uri],
}

/// What to do with a redirect response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
  /// Request the next location.
  Follow,
  /// Return the redirect response.
  Stop,
}

impl Policy {
  /// Follow up to `max` hops, then return the last redirect response.
  pub fn limited(max: usize) -> Self {
    Policy::Limit(max)
  }

  /// Never follow redirects.
  pub fn none() -> Self {
    Policy::None
  }

  /// Decide each hop with `policy`.
  ///
  /// A custom policy has to bound the chain itself, for example by looking
  /// at [`Attempt::previous`].
  ///
  /// ```rust
  /// use volley::redirect::{self, Policy};
  ///
  /// # fn run() -> volley::Result<()> {
  /// let client = volley::Client::builder()
  ///   .redirect(Policy::custom(redirect::only_same_origin))
  ///   .build()?;
  /// # drop(client);
  /// # Ok(())
  /// # }
  /// ```
  pub fn custom(policy: fn(Attempt) -> Action) -> Self {
    Policy::Custom(policy)
  }

  /// Whether this policy can ever follow.
  pub fn is_none(&self) -> bool {
    matches!(self, Policy::None | Policy::Limit(0))
  }

  pub(crate) fn check(&self, status: StatusCode, next: &Uri, previous: &[Uri]) -> Action {
    let attempt = Attempt {
      status,
      next,
      previous,
    };
    match self {
      Policy::Custom(custom) => custom(attempt),
      Policy::Limit(max) if previous.len() >= *max => attempt.stop(),
      Policy::Limit(_) => attempt.follow(),
      Policy::None => attempt.stop(),
    }
  }
}

impl Default for Policy {
  fn default() -> Policy {
    Policy::None
  }
}

impl<'a> Attempt<'a> {
  /// Status of the redirect response.
  pub fn status(&self) -> StatusCode {
    self.status
  }

  /// The location to request next.
  pub fn url(&self) -> &Uri {
    self.next
  }

  /// Targets already requested in this chain, oldest first.
  pub fn previous(&self) -> &[Uri] {
    self.previous
  }

  /// Follow the redirect.
  pub fn follow(self) -> Action {
    Action::Follow
  }

  /// Stop and return the redirect response.
  pub fn stop(self) -> Action {
    Action::Stop
  }
}

/// Follow redirects that stay on the same host, at most 10 hops.
pub fn only_same_origin(attempt: Attempt) -> Action {
  match attempt.previous().last() {
    Some(previous) if previous.host() != attempt.url().host() => attempt.stop(),
    Some(_) if attempt.previous().len() > 10 => attempt.stop(),
    _ => attempt.follow(),
  }
}

/// Whether `status` is a redirect the client knows how to follow.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
  matches!(
    status,
    StatusCode::MOVED_PERMANENTLY
      | StatusCode::FOUND
      | StatusCode::SEE_OTHER
      | StatusCode::TEMPORARY_REDIRECT
      | StatusCode::PERMANENT_REDIRECT
  )
}

/// Resolve a `Location` value against the target that answered with it.
pub(crate) fn resolve(current: &Uri, location: &str) -> Option<Uri> {
  let location = location.trim();
  if location.starts_with("https://") || location.starts_with("http://") {
    return location.parse().ok();
  }
  let scheme = current.scheme_str()?;
  let authority = current.authority()?.as_str();
  if let Some(rest) = location.strip_prefix("//") {
    return format!("{}://{}", scheme, rest).parse().ok();
  }
  let path = if location.starts_with('/') {
    location.to_string()
  } else {
    let base = current.path();
    let dir = &base[..base.rfind('/').map(|i| i + 1).unwrap_or(0)];
    format!("{}{}", if dir.is_empty() { "/" } else { dir }, location)
  };
  format!("{}://{}{}", scheme, authority, path).parse().ok()
}

/// Drop credentials when the next hop leaves the previous host.
pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Uri, previous: &[Uri]) {
  if let Some(previous) = previous.last() {
    let cross_host = next.host() != previous.host() || next.port_u16() != previous.port_u16();
    if cross_host {
      headers.remove(AUTHORIZATION);
      headers.remove(COOKIE);
      headers.remove("cookie2");
      headers.remove(PROXY_AUTHORIZATION);
      headers.remove(WWW_AUTHENTICATE);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn uri(s: &str) -> Uri {
    s.parse().unwrap()
  }

  #[test]
  fn limited_stops_after_max_hops() {
    let policy = Policy::limited(2);
    let next = uri("http://a.test/3");
    let one = [uri("http://a.test/1")];
    let two = [uri("http://a.test/1"), uri("http://a.test/2")];
    assert_eq!(policy.check(StatusCode::FOUND, &next, &one), Action::Follow);
    assert_eq!(policy.check(StatusCode::FOUND, &next, &two), Action::Stop);
    assert_eq!(Policy::none().check(StatusCode::FOUND, &next, &[]), Action::Stop);
    assert!(Policy::default().is_none());
  }

  #[test]
  fn same_origin_policy() {
    let policy = Policy::custom(only_same_origin);
    let previous = [uri("http://a.test/")];
    assert_eq!(
      policy.check(StatusCode::FOUND, &uri("http://a.test/next"), &previous),
      Action::Follow
    );
    assert_eq!(
      policy.check(StatusCode::FOUND, &uri("http://b.test/"), &previous),
      Action::Stop
    );
  }

  #[test]
  fn locations_resolve_against_current_target() {
    let current = uri("https://a.test:8443/app/login?x=1");
    assert_eq!(resolve(&current, "/home").unwrap(), uri("https://a.test:8443/home"));
    assert_eq!(resolve(&current, "next").unwrap(), uri("https://a.test:8443/app/next"));
    assert_eq!(resolve(&current, "//b.test/x").unwrap(), uri("https://b.test/x"));
    assert_eq!(resolve(&current, "http://c.test/").unwrap(), uri("http://c.test/"));
  }

  #[test]
  fn credentials_do_not_cross_hosts() {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, "Basic eA==".parse().unwrap());
    headers.insert(COOKIE, "s=1".parse().unwrap());
    remove_sensitive_headers(&mut headers, &uri("http://a.test/2"), &[uri("http://a.test/1")]);
    assert_eq!(headers.len(), 2);
    remove_sensitive_headers(&mut headers, &uri("http://b.test/"), &[uri("http://a.test/1")]);
    assert!(headers.is_empty());
  }
}
