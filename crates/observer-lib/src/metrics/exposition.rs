//! Parser for the Prometheus text exposition format
//!
//! Lines are parsed independently; a malformed line is counted and skipped
//! without affecting the rest of the scrape. Well-formed samples holding
//! `NaN` or an infinity are dropped and counted apart from malformed lines.

use crate::models::{Labels, Sample};
use chrono::{DateTime, TimeZone, Utc};

/// Samples recovered from one scrape body
#[derive(Debug, Default)]
pub struct ParsedScrape {
    pub samples: Vec<Sample>,
    /// Malformed lines
    pub skipped_lines: usize,
    /// Valid lines whose value is `NaN` or infinite
    pub non_finite_samples: usize,
}

/// Parse an exposition body; samples without a timestamp get `scraped_at`
pub fn parse_exposition(body: &str, scraped_at: DateTime<Utc>) -> ParsedScrape {
    let mut parsed = ParsedScrape::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_sample_line(line, scraped_at) {
            Some(sample) if !sample.value.is_finite() => parsed.non_finite_samples += 1,
            Some(sample) => parsed.samples.push(sample),
            None => parsed.skipped_lines += 1,
        }
    }

    parsed
}

/// Parse `name{label="value",...} value [timestamp_ms]`
fn parse_sample_line(line: &str, scraped_at: DateTime<Utc>) -> Option<Sample> {
    let mut cursor = Cursor::new(line);

    let name = cursor.take_while(is_metric_name_char);
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    let labels = if cursor.eat('{') {
        parse_labels(&mut cursor)?
    } else {
        Labels::new()
    };

    if !cursor.skip_whitespace() {
        return None;
    }
    let value: f64 = cursor.take_while(|c| !c.is_whitespace()).parse().ok()?;

    cursor.skip_whitespace();
    let timestamp = match cursor.take_while(|c| !c.is_whitespace()) {
        "" => scraped_at,
        raw => {
            let millis: i64 = raw.parse().ok()?;
            Utc.timestamp_millis_opt(millis).single()?
        }
    };

    cursor.skip_whitespace();
    if !cursor.is_done() {
        return None;
    }

    Some(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

fn parse_labels(cursor: &mut Cursor<'_>) -> Option<Labels> {
    let mut labels = Labels::new();

    loop {
        cursor.skip_whitespace();
        if cursor.eat('}') {
            return Some(labels);
        }

        let key = cursor.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if key.is_empty() || !cursor.eat('=') || !cursor.eat('"') {
            return None;
        }

        let mut value = String::new();
        loop {
            match cursor.next()? {
                '"' => break,
                '\\' => match cursor.next()? {
                    'n' => value.push('\n'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    _ => return None,
                },
                c => value.push(c),
            }
        }
        labels.insert(key.to_string(), value);

        cursor.skip_whitespace();
        if cursor.eat(',') {
            continue;
        }
        if cursor.eat('}') {
            return Some(labels);
        }
        return None;
    }
}

fn is_metric_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn is_done(&self) -> bool {
        self.rest.is_empty()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.rest.chars().next()?;
        self.rest = &self.rest[c.len_utf8()..];
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.rest.starts_with(expected) {
            self.rest = &self.rest[expected.len_utf8()..];
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| !pred(*c))
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    /// Returns whether any whitespace was consumed
    fn skip_whitespace(&mut self) -> bool {
        !self.take_while(char::is_whitespace).is_empty()
    }
}
