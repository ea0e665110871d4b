/// CSV export reader
///
/// Reads visit rows exported from the operational database as CSV. The
/// first line is the header; columns are matched by name through a
/// `ColumnMap`. Values are kept untyped except for durations, which are
/// parsed as numbers (`null`, `NA` and blanks are missing).

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::SourceError;
use crate::ingest::ColumnMap;
use crate::logging::Stage;
use crate::model::{RawRow, RawTimestamp};

// ============================================================================
// Parsing
// ============================================================================

/// Parse CSV text into raw rows.
///
/// Short rows are padded with missing values so the normalizer can report
/// them. Quoted fields may span lines. A quote still open at the end of the
/// input drops only that final record; in the header it is an error, since
/// no row can be matched to a column.
pub fn parse_rows_csv(text: &str, columns: &ColumnMap) -> Result<Vec<RawRow>, SourceError> {
    let (records, unterminated) = split_records(text);
    let mut records = records.into_iter();

    let header = match (records.next(), unterminated) {
        (Some(record), _) => record.fields,
        (None, Some(line)) => {
            return Err(SourceError::Csv {
                line,
                reason: "unterminated quoted field".to_string(),
            });
        }
        (None, None) => return Ok(Vec::new()),
    };
    if let Some(line) = unterminated {
        warn!(stage = %Stage::Normalize, line, "unterminated quoted field, dropping the final record");
    }
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    let duration_columns: Vec<&String> = if columns.duration_columns.is_empty() {
        header.iter().filter(|h| !columns.is_named(h)).collect()
    } else {
        columns.duration_columns.iter().collect()
    };

    let mut rows = Vec::new();
    for CsvRecord { line, fields } in records {
        if fields.len() > header.len() {
            warn!(stage = %Stage::Normalize, line, "row has {} fields, header has {}", fields.len(), header.len());
        }
        let cell = |name: &str| -> Option<String> {
            header
                .iter()
                .position(|h| h == name)
                .and_then(|idx| fields.get(idx))
                .map(|v| v.trim().to_string())
                .filter(|v| !is_null(v))
        };

        let durations: BTreeMap<String, Option<f64>> = duration_columns
            .iter()
            .map(|name| (name.to_string(), cell(name).and_then(|v| v.parse::<f64>().ok())))
            .collect();

        rows.push(RawRow {
            id: cell(&columns.id_column),
            timestamp: cell(&columns.timestamp_column).map(|v| classify_timestamp(&v)),
            branch: cell(&columns.branch_column),
            durations,
            description: cell(&columns.description_column),
            status: cell(&columns.status_column),
        });
    }

    Ok(rows)
}

/// All-digit values of nine or more digits are epoch seconds; anything else
/// (including compact `YYYYMMDD` dates) is left as text.
fn classify_timestamp(value: &str) -> RawTimestamp {
    if value.len() >= 9 && value.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(secs) = value.parse::<i64>() {
            return RawTimestamp::Epoch(secs);
        }
    }
    RawTimestamp::Text(value.to_string())
}

fn is_null(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("null") || value.eq_ignore_ascii_case("na")
}

/// One CSV record and the line it starts on.
struct CsvRecord {
    line: usize,
    fields: Vec<String>,
}

/// Split CSV text into records, honoring double-quoted fields with `""`
/// escapes and embedded line breaks. Blank lines are skipped.
///
/// If the input ends inside a quoted field, that record is left out and its
/// starting line is returned alongside the complete records.
fn split_records(text: &str) -> (Vec<CsvRecord>, Option<usize>) {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.trim().is_empty() => {
                current.clear();
                in_quotes = true;
                quoted = true;
            }
            (',', false) => fields.push(std::mem::take(&mut current)),
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                push_record(&mut records, start, std::mem::take(&mut fields), quoted);
                quoted = false;
                line += 1;
                start = line;
            }
            ('\n', true) => {
                current.push(c);
                line += 1;
            }
            _ => current.push(c),
        }
    }

    if in_quotes {
        return (records, Some(start));
    }
    fields.push(current);
    push_record(&mut records, start, fields, quoted);
    (records, None)
}

fn push_record(records: &mut Vec<CsvRecord>, line: usize, fields: Vec<String>, quoted: bool) {
    let blank = !quoted && fields.len() == 1 && fields[0].trim().is_empty();
    if !blank {
        records.push(CsvRecord { line, fields });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
id,timestamp,branch,wait_time,service_time,description,status
1,2024-05-01 09:00,Centro,5,12,\"Blood test, fasting\",completed
2,2024-05-01 09:10,Centro,null,8,Vaccination,completed
3,1714554000,Norte,7,,\"He said \"\"hi\"\"\",
";

    #[test]
    fn test_parses_rows_and_infers_duration_columns() {
        let rows = parse_rows_csv(SAMPLE, &ColumnMap::default()).expect("sample should parse");
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.id.as_deref(), Some("1"));
        assert_eq!(first.branch.as_deref(), Some("Centro"));
        assert_eq!(first.description.as_deref(), Some("Blood test, fasting"));
        assert_eq!(first.durations.get("wait_time"), Some(&Some(5.0)));
        assert_eq!(first.durations.get("service_time"), Some(&Some(12.0)));
        assert_eq!(first.durations.len(), 2, "only unnamed columns are durations");
    }

    #[test]
    fn test_null_and_blank_cells_are_missing() {
        let rows = parse_rows_csv(SAMPLE, &ColumnMap::default()).unwrap();
        assert_eq!(rows[1].durations.get("wait_time"), Some(&None));
        assert_eq!(rows[2].durations.get("service_time"), Some(&None));
        assert_eq!(rows[2].status, None);
    }

    #[test]
    fn test_escaped_quotes_and_epoch_timestamps() {
        let rows = parse_rows_csv(SAMPLE, &ColumnMap::default()).unwrap();
        assert_eq!(rows[2].description.as_deref(), Some("He said \"hi\""));
        assert_eq!(rows[2].timestamp, Some(RawTimestamp::Epoch(1_714_554_000)));
        assert_eq!(
            rows[0].timestamp,
            Some(RawTimestamp::Text("2024-05-01 09:00".to_string()))
        );
    }

    #[test]
    fn test_compact_date_stays_text() {
        assert_eq!(classify_timestamp("20240501"), RawTimestamp::Text("20240501".to_string()));
    }

    #[test]
    fn test_short_rows_are_padded_with_missing_values() {
        let text = "id,timestamp,branch,wait_time\n9,2024-05-01 09:00\n";
        let rows = parse_rows_csv(text, &ColumnMap::default()).unwrap();
        assert_eq!(rows[0].branch, None);
        assert_eq!(rows[0].durations.get("wait_time"), Some(&None));
    }

    #[test]
    fn test_quoted_field_may_span_lines() {
        let text = "id,description\n1,\"a\nb\"\n2,plain\n";
        let rows = parse_rows_csv(text, &ColumnMap::default()).expect("embedded newline is valid CSV");
        assert_eq!(rows.len(), 2, "the embedded newline must not split the record");
        assert_eq!(rows[0].description.as_deref(), Some("a\nb"));
        assert_eq!(rows[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn test_crlf_line_endings_are_record_breaks() {
        let text = "id,status\r\n1,done\r\n\r\n2,open\r\n";
        let rows = parse_rows_csv(text, &ColumnMap::default()).unwrap();
        assert_eq!(rows.len(), 2, "blank CRLF line is skipped");
        assert_eq!(rows[0].status.as_deref(), Some("done"), "no trailing carriage return");
    }

    #[test]
    fn test_unterminated_final_quote_drops_only_that_record() {
        let text = "id,description\n1,first\n2,second\n3,\"never closed\n";
        let rows = parse_rows_csv(text, &ColumnMap::default()).expect("earlier rows must survive");
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("1"), Some("2")]);
    }

    #[test]
    fn test_unterminated_quote_in_header_is_an_error() {
        let text = "id,\"description\n1,x\n";
        let err = parse_rows_csv(text, &ColumnMap::default()).unwrap_err();
        assert!(matches!(err, SourceError::Csv { line: 1, .. }), "got {:?}", err);
    }

    #[test]
    fn test_record_lines_count_embedded_breaks() {
        let (records, unterminated) = split_records("h\n\"a\nb\"\n\nc\n");
        let lines: Vec<_> = records.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![1, 2, 5], "records start after the multi-line field and the blank line");
        assert_eq!(unterminated, None);
    }

    #[test]
    fn test_explicit_duration_columns_restrict_parsing() {
        let columns = ColumnMap {
            duration_columns: vec!["wait_time".to_string()],
            ..ColumnMap::default()
        };
        let rows = parse_rows_csv(SAMPLE, &columns).unwrap();
        assert_eq!(rows[0].durations.len(), 1);
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        assert!(parse_rows_csv("", &ColumnMap::default()).unwrap().is_empty());
    }
}
