//! Filename pattern parsing, rendering and matching
//!
//! Placeholders: `{name}`, `{counter}` / `{counter:N}` and `{timestamp}`.
//! Literal text may carry strftime directives (`%Y`, `%H`, ...) evaluated
//! against the frame timestamp.

use crate::error::{Error, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, TimeZone};
use std::fmt::Write as _;

/// Counter width used when neither config nor pattern specifies one
pub const DEFAULT_COUNTER_WIDTH: usize = 4;

/// Longest zero-padding accepted for `{counter:N}`
const MAX_COUNTER_WIDTH: usize = 20;

/// ISO-8601 basic format, free of characters that break FAT/SMB shares
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%z";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Strftime(String),
    Name,
    Counter(usize),
    Timestamp,
}

/// A validated filename pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenamePattern {
    source: String,
    segments: Vec<Segment>,
}

impl FilenamePattern {
    /// Parse and validate `pattern`; `counter_width` pads bare `{counter}`.
    pub fn parse(pattern: &str, counter_width: usize) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(Error::InvalidPattern("pattern is empty".into()));
        }
        if pattern.contains('/') || pattern.contains('\\') || pattern.contains('\0') {
            return Err(Error::InvalidPattern(format!(
                "'{pattern}' must be a bare filename without path separators"
            )));
        }
        if counter_width == 0 || counter_width > MAX_COUNTER_WIDTH {
            return Err(Error::InvalidPattern(format!(
                "counter width must be between 1 and {MAX_COUNTER_WIDTH}, got {counter_width}"
            )));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(Error::InvalidPattern(format!(
                                    "nested '{{' in '{pattern}'"
                                )));
                            }
                            other => name.push(other),
                        }
                    }
                    if !closed {
                        return Err(Error::InvalidPattern(format!(
                            "unterminated placeholder '{{{name}' in '{pattern}'"
                        )));
                    }
                    flush_literal(&mut literal, &mut segments, pattern)?;
                    segments.push(placeholder(&name, counter_width, pattern)?);
                }
                '}' => {
                    return Err(Error::InvalidPattern(format!(
                        "unmatched '}}' in '{pattern}'"
                    )));
                }
                other => literal.push(other),
            }
        }
        flush_literal(&mut literal, &mut segments, pattern)?;

        if !segments.iter().any(|s| matches!(s, Segment::Counter(_))) {
            return Err(Error::InvalidPattern(format!(
                "'{pattern}' must contain a {{counter}} placeholder"
            )));
        }
        for pair in segments.windows(2) {
            let ambiguous = match pair {
                [Segment::Counter(_), next] => emits_digits_at(next, Edge::Leading),
                [prev, Segment::Counter(_)] => emits_digits_at(prev, Edge::Trailing),
                _ => false,
            };
            if ambiguous {
                return Err(Error::InvalidPattern(format!(
                    "'{pattern}' places {{counter}} directly against a date/time field; \
                     separate them with a non-digit literal"
                )));
            }
        }

        let parsed = Self {
            source: pattern.to_string(),
            segments,
        };

        // Directives such as %D expand to separators; catch them up front.
        let sample = FixedOffset::east_opt(0)
            .and_then(|tz| tz.with_ymd_and_hms(2000, 12, 31, 23, 59, 59).single())
            .ok_or_else(|| Error::Other("failed to build sample timestamp".into()))?;
        parsed.render("project", 0, &sample)?;

        Ok(parsed)
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render a filename. Identical inputs always give identical output.
    pub fn render(
        &self,
        project: &str,
        counter: u64,
        timestamp: &DateTime<FixedOffset>,
    ) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Strftime(text) => {
                    write!(out, "{}", timestamp.format_with_items(StrftimeItems::new(text)))
                        .map_err(|_| {
                            Error::InvalidPattern(format!(
                                "'{text}' could not be formatted for {timestamp}"
                            ))
                        })?;
                }
                Segment::Name => out.push_str(project),
                Segment::Counter(width) => {
                    let _ = write!(out, "{counter:0width$}");
                }
                Segment::Timestamp => {
                    let _ = write!(out, "{}", timestamp.format(TIMESTAMP_FORMAT));
                }
            }
        }

        if out.is_empty() || out == "." || out == ".." {
            return Err(Error::InvalidPattern(format!(
                "'{}' rendered an unusable filename '{out}'",
                self.source
            )));
        }
        if out.contains('/') || out.contains('\\') {
            return Err(Error::InvalidPattern(format!(
                "'{}' rendered '{out}', which contains a path separator",
                self.source
            )));
        }
        Ok(out)
    }

    /// Counter embedded in `filename` if it could have been produced by
    /// this pattern for `project`.
    ///
    /// Date/time portions match any text, and counters match any run of
    /// digits so files written under a different padding width still count.
    pub fn match_counter(&self, project: &str, filename: &str) -> Option<u64> {
        match_segments(&self.segments, project, filename, None)
    }
}

/// Render with the default counter width.
pub fn render(
    pattern: &str,
    project_name: &str,
    counter: u64,
    timestamp: &DateTime<FixedOffset>,
) -> Result<String> {
    FilenamePattern::parse(pattern, DEFAULT_COUNTER_WIDTH)?.render(project_name, counter, timestamp)
}

fn placeholder(name: &str, counter_width: usize, pattern: &str) -> Result<Segment> {
    match name {
        "name" => Ok(Segment::Name),
        "counter" => Ok(Segment::Counter(counter_width)),
        "timestamp" => Ok(Segment::Timestamp),
        other => {
            if let Some(width) = other.strip_prefix("counter:") {
                let width: usize = width.parse().map_err(|_| {
                    Error::InvalidPattern(format!("bad counter width '{width}' in '{pattern}'"))
                })?;
                if width == 0 || width > MAX_COUNTER_WIDTH {
                    return Err(Error::InvalidPattern(format!(
                        "counter width {width} out of range in '{pattern}'"
                    )));
                }
                Ok(Segment::Counter(width))
            } else {
                Err(Error::InvalidPattern(format!(
                    "unknown placeholder '{{{other}}}' in '{pattern}'"
                )))
            }
        }
    }
}

fn flush_literal(literal: &mut String, segments: &mut Vec<Segment>, pattern: &str) -> Result<()> {
    if literal.is_empty() {
        return Ok(());
    }
    let text = std::mem::take(literal);
    if text.contains('%') {
        if StrftimeItems::new(&text).any(|item| matches!(item, Item::Error)) {
            return Err(Error::InvalidPattern(format!(
                "invalid date/time directive in '{text}' of '{pattern}'"
            )));
        }
        segments.push(Segment::Strftime(text));
    } else {
        segments.push(Segment::Literal(text));
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Edge {
    Leading,
    Trailing,
}

/// Whether `segment` may render a digit at `edge`, where it touches a counter.
fn emits_digits_at(segment: &Segment, edge: Edge) -> bool {
    match segment {
        Segment::Timestamp => true,
        Segment::Strftime(text) => {
            let mut items = StrftimeItems::new(text);
            let item = match edge {
                Edge::Leading => items.next(),
                Edge::Trailing => items.last(),
            };
            let fixed = match item {
                Some(Item::Literal(s)) | Some(Item::Space(s)) => s,
                _ => return true,
            };
            let c = match edge {
                Edge::Leading => fixed.chars().next(),
                Edge::Trailing => fixed.chars().next_back(),
            };
            c.is_none_or(|c| c.is_ascii_digit())
        }
        Segment::Literal(_) | Segment::Name | Segment::Counter(_) => false,
    }
}

/// Fixed text a strftime segment always starts and ends with.
fn literal_edges(text: &str) -> (String, String) {
    let items: Vec<Item<'_>> = StrftimeItems::new(text).collect();
    let literal = |item: &Item<'_>| match item {
        Item::Literal(s) | Item::Space(s) => Some(s.to_string()),
        _ => None,
    };

    let prefix: String = items.iter().map_while(literal).collect();
    if items.iter().all(|item| literal(item).is_some()) {
        // No directives at all; the whole segment is literal.
        return (prefix, String::new());
    }
    let mut suffix: Vec<String> = items.iter().rev().map_while(literal).collect();
    suffix.reverse();
    (prefix, suffix.concat())
}

fn match_segments(
    segments: &[Segment],
    project: &str,
    rest: &str,
    counter: Option<u64>,
) -> Option<u64> {
    let Some((segment, tail)) = segments.split_first() else {
        return if rest.is_empty() { counter } else { None };
    };

    match segment {
        Segment::Literal(text) => {
            match_segments(tail, project, rest.strip_prefix(text.as_str())?, counter)
        }
        Segment::Name => match_segments(tail, project, rest.strip_prefix(project)?, counter),
        Segment::Counter(_) => {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            (1..=digits).rev().find_map(|len| {
                let value: u64 = rest[..len].parse().ok()?;
                if counter.is_some_and(|seen| seen != value) {
                    return None;
                }
                match_segments(tail, project, &rest[len..], Some(value))
            })
        }
        Segment::Strftime(text) => {
            let (prefix, suffix) = literal_edges(text);
            (0..=rest.len())
                .rev()
                .filter(|&i| rest.is_char_boundary(i))
                .filter(|&i| {
                    let consumed = &rest[..i];
                    consumed.len() >= prefix.len() + suffix.len()
                        && consumed.starts_with(&prefix)
                        && consumed.ends_with(&suffix)
                })
                .find_map(|i| match_segments(tail, project, &rest[i..], counter))
        }
        Segment::Timestamp => (0..=rest.len())
            .rev()
            .filter(|&i| rest.is_char_boundary(i))
            .find_map(|i| match_segments(tail, project, &rest[i..], counter)),
    }
}
