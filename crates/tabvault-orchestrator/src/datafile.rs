//! Export data-file reading
//!
//! Exported data files are newline-delimited JSON, optionally gzipped. Each
//! line is either `{"Item": {...}}` or a bare tagged record. Lines that fail
//! to parse or decode are counted and skipped; the rest of the file is kept.

use flate2::read::GzDecoder;
use serde_json::Value as Json;
use std::io::Read;
use tabvault_common::{Result, VaultError};
use tracing::{debug, warn};

use crate::codec::{decode_item, Item};
use crate::storage::ObjectStore;

/// Suffixes recognised as export data files
pub const DATA_FILE_SUFFIXES: &[&str] = &[".json.gz", ".json"];

/// Number of per-line decode failures logged individually per file.
const LOGGED_DECODE_ERRORS: usize = 5;

pub fn is_data_file(key: &str) -> bool {
    DATA_FILE_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFile {
    pub items: Vec<Item>,
    /// Lines seen, blank ones included
    pub lines: usize,
    pub decode_errors: usize,
}

pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed)
}

fn parse_line(line: &str) -> Result<Item> {
    let record: Json = serde_json::from_str(line)?;
    match record.get("Item") {
        Some(item) => decode_item(item),
        None => decode_item(&record),
    }
}

/// Parse newline-delimited export records.
pub fn parse_records(content: &str, source: &str) -> ParsedFile {
    let mut parsed = ParsedFile::default();

    for (index, line) in content.trim().lines().enumerate() {
        parsed.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(item) => parsed.items.push(item),
            Err(e) => {
                parsed.decode_errors += 1;
                if parsed.decode_errors <= LOGGED_DECODE_ERRORS {
                    warn!(file = %source, line = index + 1, error = %e, "Skipping undecodable record");
                }
            },
        }
    }

    if parsed.decode_errors > 0 {
        warn!(
            file = %source,
            errors = parsed.decode_errors,
            lines = parsed.lines,
            "File had undecodable records"
        );
    }

    parsed
}

/// Download and parse one data file.
pub async fn read_data_file(store: &dyn ObjectStore, key: &str) -> Result<ParsedFile> {
    let raw = store.get_object(key).await?;
    let bytes = if key.ends_with(".gz") {
        decompress_gzip(&raw)?
    } else {
        raw
    };

    let content = String::from_utf8(bytes)
        .map_err(|e| VaultError::Decode(format!("{} is not valid UTF-8: {}", key, e)))?;

    let parsed = parse_records(&content, key);
    debug!(file = %key, items = parsed.items.len(), "Parsed data file");
    Ok(parsed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    #[test]
    fn test_is_data_file() {
        assert!(is_data_file("exports/d/t/AWSDynamoDB/01/data/abc.json.gz"));
        assert!(is_data_file("exports/d/t/part.json"));
        assert!(!is_data_file("exports/d/t/AWSDynamoDB/01/_started"));
        assert!(!is_data_file("exports/d/t/AWSDynamoDB/01/manifest-files.md5"));
    }

    #[test]
    fn test_parse_records_wrapped_and_bare() {
        let content = concat!(
            "{\"Item\":{\"id\":{\"S\":\"a\"}}}\n",
            "\n",
            "{\"id\":{\"S\":\"b\"},\"n\":{\"N\":\"3\"}}\n",
        );
        let parsed = parse_records(content, "test");
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.decode_errors, 0);
        assert_eq!(parsed.items[1].get("id"), Some(&Value::String("b".to_string())));
    }

    #[test]
    fn test_parse_records_skips_bad_lines() {
        let content = concat!(
            "{\"Item\":{\"id\":{\"S\":\"a\"}}}\n",
            "not json\n",
            "{\"Item\":{\"id\":{\"XX\":\"?\"}}}\n",
            "{\"Item\":{\"id\":{\"S\":\"c\"}}}\n",
        );
        let parsed = parse_records(content, "test");
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.decode_errors, 2);
        assert_eq!(parsed.lines, 4);
    }

    #[test]
    fn test_decompress_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"Item\":{}}\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = decompress_gzip(&compressed).unwrap();
        assert_eq!(decompressed, b"{\"Item\":{}}\n");
        assert!(decompress_gzip(b"plain").is_err());
    }
}
