use crate::error::{ParseError, RenderError};

use super::normalize::{canonical_values, push, RawEntry, CANONICAL_KEYS};
use super::Host;

pub(super) fn entries(source: &str) -> Result<Vec<RawEntry>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(source.as_bytes());

    let syntax = |e: csv::Error| ParseError::Syntax {
        format: "csv",
        message: e.to_string(),
    };

    let headers = reader.headers().map_err(syntax)?.clone();
    reader
        .records()
        .map(|record| {
            let record = record.map_err(syntax)?;
            let mut entry = RawEntry::new();
            for (key, value) in headers.iter().zip(record.iter()) {
                push(&mut entry, key, value);
            }
            Ok(entry)
        })
        .collect()
}

pub(super) fn render(hosts: &[Host]) -> Result<String, RenderError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CANONICAL_KEYS)?;
    for host in hosts {
        writer.write_record(canonical_values(host))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| RenderError::Csv(e.into_error().into()))?;
    String::from_utf8(bytes).map_err(|_| RenderError::Utf8)
}
