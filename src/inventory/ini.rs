use std::fmt::Write as _;

use crate::error::ParseError;

use super::normalize::{canonical_values, push, RawEntry, CANONICAL_KEYS};
use super::Host;

/// Section whose keys apply to every host, as in Python's configparser.
const DEFAULTS_SECTION: &str = "DEFAULT";

struct Section {
    name: String,
    pairs: RawEntry,
}

fn syntax(line: usize, message: &str) -> ParseError {
    ParseError::Syntax {
        format: "ini",
        message: format!("line {line}: {message}"),
    }
}

pub(super) fn entries(source: &str) -> Result<Vec<RawEntry>, ParseError> {
    let mut defaults = RawEntry::new();
    let mut sections: Vec<Section> = Vec::new();
    let mut in_defaults = false;

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| syntax(line_no, "unterminated section header"))?
                .trim();
            if name.is_empty() {
                return Err(syntax(line_no, "empty section name"));
            }
            if name == DEFAULTS_SECTION {
                in_defaults = true;
                continue;
            }
            if sections.iter().any(|section| section.name == name) {
                return Err(ParseError::DuplicateHost {
                    hostname: name.to_string(),
                });
            }
            in_defaults = false;
            sections.push(Section {
                name: name.to_string(),
                pairs: RawEntry::new(),
            });
            continue;
        }

        let split_at = trimmed
            .find(|c: char| c == '=' || c == ':')
            .ok_or_else(|| syntax(line_no, "expected `key = value`"))?;
        let (key, value) = (&trimmed[..split_at], &trimmed[split_at + 1..]);
        if key.trim().is_empty() {
            return Err(syntax(line_no, "empty key"));
        }

        if in_defaults {
            push(&mut defaults, key, value);
        } else {
            let section = sections
                .last_mut()
                .ok_or_else(|| syntax(line_no, "key outside of a section"))?;
            push(&mut section.pairs, key, value);
        }
    }

    Ok(sections
        .into_iter()
        .map(|section| {
            let mut entry = RawEntry::new();
            if !section.pairs.iter().any(|(key, _)| key == "hostname") {
                push(&mut entry, "hostname", &section.name);
            }
            entry.extend(section.pairs);
            entry.extend(defaults.iter().cloned());
            entry
        })
        .collect())
}

pub(super) fn render(hosts: &[Host]) -> String {
    let mut out = String::new();
    for (index, host) in hosts.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        let values = canonical_values(host);
        let _ = writeln!(out, "[{}]", values[0]);
        for (key, value) in CANONICAL_KEYS.iter().zip(values.iter()).skip(1) {
            if !value.is_empty() {
                let _ = writeln!(out, "{key} = {value}");
            }
        }
    }
    out
}
