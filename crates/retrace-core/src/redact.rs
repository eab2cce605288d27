//! Literal secret scrubbing for strings, bytes, headers and JSON bodies.

use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;

use crate::request::Headers;

/// Placeholder written in place of every secret occurrence.
pub const REDACTED: &str = "REDACTED";

/// Replaces any literal occurrence of a configured secret with [`REDACTED`].
///
/// All secrets are folded into one alternation pattern, in the order they
/// were given. A redactor built from no (or only empty) secrets passes every
/// input through untouched.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Option<(Regex, BytesRegex)>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let escaped: Vec<String> = secrets
            .into_iter()
            .filter(|s| !s.as_ref().is_empty())
            .map(|s| regex::escape(s.as_ref()))
            .collect();
        if escaped.is_empty() {
            return Ok(Self::default());
        }

        let pattern = escaped.join("|");
        let text = Regex::new(&pattern)?;
        let bytes = BytesRegex::new(&pattern)?;
        Ok(Self {
            patterns: Some((text, bytes)),
        })
    }

    /// Parse a comma separated secret list, e.g. the value of `RETRACE_SECRETS`.
    pub fn from_comma_separated(secrets: &str) -> Result<Self, regex::Error> {
        Self::new(secrets.split(','))
    }

    pub fn is_active(&self) -> bool {
        self.patterns.is_some()
    }

    pub fn redact_str<'a>(&self, input: &'a str) -> Cow<'a, str> {
        match &self.patterns {
            Some((re, _)) => re.replace_all(input, REDACTED),
            None => Cow::Borrowed(input),
        }
    }

    /// `None` stays `None`; an empty buffer stays empty.
    pub fn redact_bytes<'a>(&self, input: Option<&'a [u8]>) -> Option<Cow<'a, [u8]>> {
        let input = input?;
        Some(match &self.patterns {
            Some((_, re)) => re.replace_all(input, REDACTED.as_bytes()),
            None => Cow::Borrowed(input),
        })
    }

    /// Redacts every header value in place, each value scanned on its own.
    pub fn redact_headers(&self, headers: &mut Headers) {
        if !self.is_active() {
            return;
        }
        for values in headers.values_mut() {
            for value in values.iter_mut() {
                if let Cow::Owned(redacted) = self.redact_str(value) {
                    *value = redacted;
                }
            }
        }
    }

    /// Returns a copy of `value` with every string leaf redacted. Object keys
    /// are left alone.
    pub fn redact_value(&self, value: &Value) -> Value {
        if !self.is_active() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(s).into_owned()),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
