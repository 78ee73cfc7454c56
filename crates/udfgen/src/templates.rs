use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

/// A string with `$name` substitution points, used for every generated SQL
/// artifact: the worker binds table names, the udf name, the request id and
/// its privacy floor at execution time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template {
    text: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The placeholder names appearing in the template, in order of first
    /// appearance.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, _) in scan(&self.text) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Substitute every placeholder. Fails on a placeholder missing from
    /// the mapping, so a worker can never execute a statement with a hole
    /// left in it.
    pub fn substitute(&self, mapping: &BTreeMap<String, String>) -> anyhow::Result<String> {
        let mut out = String::with_capacity(self.text.len());
        let mut last = 0;
        for (name, span) in scan(&self.text) {
            out.push_str(&self.text[last..span.0]);
            let value = mapping
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("No substitution provided for ${name}"))?;
            out.push_str(value);
            last = span.1;
        }
        out.push_str(&self.text[last..]);
        Ok(out)
    }
}

/// Find `$identifier` spans. `$$` is not treated specially; generated
/// artifacts never need a literal dollar.
fn scan(text: &str) -> Vec<(String, (usize, usize))> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i;
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 1 {
                spans.push((text[i + 1..j].to_owned(), (start, j)));
                i = j;
                continue;
            }
        }
        i += 1;
    }
    spans
}
