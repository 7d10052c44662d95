//! IHM CSV export parser
//!
//! The terminals write semicolon, comma or tab separated text in whatever
//! encoding the panel firmware uses. The parser sniffs the encoding and the
//! separator, decides which of the two record layouts a file holds, and
//! turns each line into a typed row.
//!
//! # Layouts
//!
//! ```text
//! feed report:  Dia;Hora;Nome;Form1;Form2;Prod_1;...;Prod_40
//! peanut log:   Dia;Hora;?;?;CodigoProduto;NomeProduto;?;?;Peso;?;Balanca
//! ```
//!
//! Parsing never fails at file level. Lines with too few fields are skipped
//! and counted; bad numbers fall back to zero.

use tracing::{debug, warn};

use super::models::{FileKind, FlowRow, ParsedRow, ProductionRow, PRODUCT_SLOTS};

/// Minimum fields for a feed report line (date, time, label, two codes, one quantity)
pub const MIN_PRODUCTION_FIELDS: usize = 6;

/// Minimum fields for a peanut log line (weight sits at offset 8)
pub const MIN_FLOW_FIELDS: usize = 9;

/// Column where product quantities start in a feed report
const FIRST_QUANTITY_COLUMN: usize = 5;

/// Number of leading lines inspected when classifying a file
const KIND_SAMPLE_LINES: usize = 5;

/// Above this many columns a file is treated as a feed report
const PRODUCTION_COLUMN_THRESHOLD: usize = 20;

const SEPARATORS: [char; 3] = [';', ',', '\t'];

const FLOW_KEYWORDS: [&str; 4] = ["amendoim", "balanca", "balança", "caixa"];
const PRODUCTION_KEYWORDS: [&str; 4] = ["formula", "fórmula", "prod_", "batida"];

const PRODUCTION_HEADER_TOKENS: [&str; 3] = ["Dia", "Data", "Nome"];
const FLOW_HEADER_TOKENS: [&str; 3] = ["Dia", "Data", "Hora"];

/// Text encodings found in IHM exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8 with a leading byte-order mark
    Utf8Bom,
    Utf8,
    /// UTF-16 little endian with a leading byte-order mark
    Utf16Le,
    /// ISO-8859-1
    Latin1,
}

impl TextEncoding {
    /// Decode `bytes`, dropping any byte-order mark
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8Bom => String::from_utf8_lossy(&bytes[3..]).into_owned(),
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le => {
                let units: Vec<u16> = bytes[2..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            },
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Pick the encoding of an export file
///
/// A BOM wins. Without one the bytes are tried as UTF-8, and anything that
/// does not decode cleanly is read as Latin-1.
pub fn detect_encoding(bytes: &[u8]) -> TextEncoding {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return TextEncoding::Utf8Bom;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return TextEncoding::Utf16Le;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains(char::REPLACEMENT_CHARACTER) => TextEncoding::Utf8,
        _ => TextEncoding::Latin1,
    }
}

/// Decode a whole file with its detected encoding
pub fn decode_text(bytes: &[u8]) -> String {
    detect_encoding(bytes).decode(bytes)
}

/// Most frequent of `;`, `,` and tab in the line; ties go to that order
pub fn detect_separator(first_line: &str) -> char {
    let mut best = SEPARATORS[0];
    let mut best_count = 0;
    for separator in SEPARATORS {
        let count = first_line.matches(separator).count();
        if count > best_count {
            best = separator;
            best_count = count;
        }
    }
    best
}

/// Classify a file from its first lines
pub fn detect_file_kind(sample_lines: &[&str]) -> FileKind {
    let sample: Vec<&str> = sample_lines.iter().take(KIND_SAMPLE_LINES).copied().collect();
    let Some(first) = sample.first() else {
        return FileKind::Unknown;
    };

    let content = sample.join(" ").to_lowercase();
    if FLOW_KEYWORDS.iter().any(|k| content.contains(k)) {
        return FileKind::Flow;
    }
    if PRODUCTION_KEYWORDS.iter().any(|k| content.contains(k)) {
        return FileKind::Production;
    }

    let columns = first.split(detect_separator(first)).count();
    if columns > PRODUCTION_COLUMN_THRESHOLD {
        FileKind::Production
    } else {
        FileKind::Flow
    }
}

/// Rows accepted from one file plus the number of malformed lines skipped
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome<T> {
    pub rows: Vec<T>,
    pub skipped_lines: usize,
}

impl<T> ParseOutcome<T> {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            skipped_lines: 0,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ParseOutcome<U> {
        ParseOutcome {
            rows: self.rows.into_iter().map(f).collect(),
            skipped_lines: self.skipped_lines,
        }
    }
}

/// A parsed file together with the layout it was read as
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub kind: FileKind,
    pub outcome: ParseOutcome<ParsedRow>,
}

/// Parser for IHM CSV exports
#[derive(Debug, Clone, Default)]
pub struct RecordParser;

impl RecordParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a file, classifying it first
    ///
    /// `expected` is the layout the collecting line exports. It is used when
    /// the content is ambiguous, and it also wins when the heuristic disagrees,
    /// because the line decides which table the rows belong to.
    pub fn parse_file(&self, bytes: &[u8], expected: FileKind) -> ParsedFile {
        let text = decode_text(bytes);
        let sample: Vec<&str> = text.lines().take(KIND_SAMPLE_LINES).collect();
        let detected = detect_file_kind(&sample);

        let kind = match (detected, expected) {
            (FileKind::Unknown, expected) => expected,
            (detected, FileKind::Unknown) => detected,
            (detected, expected) if detected != expected => {
                warn!(
                    ?detected,
                    ?expected,
                    "File content looks like a different layout, parsing as expected layout"
                );
                expected
            },
            (detected, _) => detected,
        };

        let outcome = match kind {
            FileKind::Production => self.parse_production_text(&text).map(ParsedRow::Production),
            FileKind::Flow => self.parse_flow_text(&text).map(ParsedRow::Flow),
            FileKind::Unknown => ParseOutcome::empty(),
        };

        ParsedFile { kind, outcome }
    }

    /// Parse a feed batch report
    pub fn parse_production_file(&self, bytes: &[u8]) -> ParseOutcome<ProductionRow> {
        self.parse_production_text(&decode_text(bytes))
    }

    /// Parse a peanut weighing log
    ///
    /// Rows keep their raw scale identifier; the pipeline turns it into an
    /// intake/output role using the endpoint default.
    pub fn parse_flow_file(&self, bytes: &[u8]) -> ParseOutcome<FlowRow> {
        self.parse_flow_text(&decode_text(bytes))
    }

    fn parse_production_text(&self, text: &str) -> ParseOutcome<ProductionRow> {
        parse_lines(text, &PRODUCTION_HEADER_TOKENS, parse_production_line)
    }

    fn parse_flow_text(&self, text: &str) -> ParseOutcome<FlowRow> {
        parse_lines(text, &FLOW_HEADER_TOKENS, parse_flow_line)
    }
}

fn parse_lines<T>(
    text: &str,
    header_tokens: &[&str],
    parse_line: impl Fn(&[&str]) -> Option<T>,
) -> ParseOutcome<T> {
    let mut outcome = ParseOutcome::empty();
    let mut lines = text.lines().enumerate().peekable();

    let Some((_, first)) = lines.peek() else {
        return outcome;
    };

    let separator = detect_separator(first);
    if header_tokens.iter().any(|token| first.contains(token)) {
        debug!("Skipping header line");
        lines.next();
    }

    for (index, raw) in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(separator).collect();
        match parse_line(&fields) {
            Some(row) => outcome.rows.push(row),
            None => {
                warn!(line = index + 1, fields = fields.len(), "Skipping malformed line");
                outcome.skipped_lines += 1;
            },
        }
    }

    debug!(
        accepted = outcome.rows.len(),
        skipped = outcome.skipped_lines,
        separator = ?separator,
        "Parsed export file"
    );

    outcome
}

fn parse_production_line(fields: &[&str]) -> Option<ProductionRow> {
    if fields.len() < MIN_PRODUCTION_FIELDS {
        return None;
    }

    let quantities = fields
        .iter()
        .skip(FIRST_QUANTITY_COLUMN)
        .take(PRODUCT_SLOTS)
        .map(|value| lenient_decimal(value))
        .collect();

    Some(ProductionRow {
        date: fields[0].trim().to_string(),
        time: fields[1].trim().to_string(),
        label: fields[2].trim().to_string(),
        code1: lenient_int(fields[3]),
        code2: lenient_int(fields[4]),
        quantities,
    })
}

fn parse_flow_line(fields: &[&str]) -> Option<FlowRow> {
    if fields.len() < MIN_FLOW_FIELDS {
        return None;
    }

    let weight = lenient_decimal(fields[8]);
    if weight < 0.0 {
        return None;
    }

    let scale = fields
        .get(10)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    Some(FlowRow {
        date: fields[0].trim().to_string(),
        time: fields[1].trim().to_string(),
        product_code: fields[4].trim().to_string(),
        product_name: fields[5].trim().to_string(),
        weight,
        scale,
    })
}

fn clean_number(value: &str) -> String {
    value.trim().replace('"', "")
}

/// Integer field, `None` when blank or not a number
pub fn lenient_int(value: &str) -> Option<i32> {
    clean_number(value).parse().ok()
}

/// Decimal field with comma or dot as decimal separator, zero on failure
pub fn lenient_decimal(value: &str) -> f64 {
    clean_number(value)
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_encoding_boms() {
        assert_eq!(detect_encoding(&[0xEF, 0xBB, 0xBF, b'a']), TextEncoding::Utf8Bom);
        assert_eq!(detect_encoding(&[0xFF, 0xFE, b'a', 0]), TextEncoding::Utf16Le);
        assert_eq!(detect_encoding("Ração;1".as_bytes()), TextEncoding::Utf8);
    }

    #[test]
    fn test_invalid_utf8_falls_back_to_latin1() {
        // "Ração" in ISO-8859-1
        let bytes = [b'R', b'a', 0xE7, 0xE3, b'o'];
        assert_eq!(detect_encoding(&bytes), TextEncoding::Latin1);
        assert_eq!(decode_text(&bytes), "Ração");
    }

    #[test]
    fn test_decode_utf16le_and_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "Dia;Hora".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&bytes), "Dia;Hora");

        let mut utf8 = vec![0xEF, 0xBB, 0xBF];
        utf8.extend_from_slice(b"a;b");
        assert_eq!(decode_text(&utf8), "a;b");
    }

    #[test]
    fn test_detect_separator() {
        assert_eq!(detect_separator("a,b;c;d;e"), ';');
        assert_eq!(detect_separator("a,b,c"), ',');
        assert_eq!(detect_separator("a\tb\tc;d"), '\t');
        // ties resolve in precedence order
        assert_eq!(detect_separator("a;b,c"), ';');
        assert_eq!(detect_separator("a,b\tc"), ',');
        assert_eq!(detect_separator("plain"), ';');
    }

    #[test]
    fn test_detect_file_kind_keywords() {
        assert_eq!(detect_file_kind(&["Dia;Hora;Balanca"]), FileKind::Flow);
        assert_eq!(detect_file_kind(&["x;y", "Amendoim Cru;1"]), FileKind::Flow);
        assert_eq!(detect_file_kind(&["Dia;Hora;Formula;Prod_1"]), FileKind::Production);
        assert_eq!(detect_file_kind(&[]), FileKind::Unknown);
    }

    #[test]
    fn test_detect_file_kind_column_count() {
        let wide = vec!["1"; 25].join(";");
        assert_eq!(detect_file_kind(&[wide.as_str()]), FileKind::Production);
        assert_eq!(detect_file_kind(&["1;2;3;4;5;6;7;8;9;10;11"]), FileKind::Flow);
    }

    #[test]
    fn test_production_line_scenario() {
        let parser = RecordParser::new();
        let outcome = parser.parse_production_file(b"01/03/2024;07:30;FormulaX;5;9;100;200;50");

        assert_eq!(outcome.rows.len(), 1);
        let row = &outcome.rows[0];
        assert_eq!(row.date, "01/03/2024");
        assert_eq!(row.time, "07:30");
        assert_eq!(row.label, "FormulaX");
        assert_eq!(row.code1, Some(5));
        assert_eq!(row.code2, Some(9));
        assert_eq!(row.quantities, vec![100.0, 200.0, 50.0]);

        let slots = row.product_slots();
        assert_eq!(slots[2], 50.0);
        assert_eq!(slots[39], 0.0);
    }

    #[test]
    fn test_production_short_lines_are_skipped() {
        let parser = RecordParser::new();
        let content = "Dia;Hora;Nome;Form1;Form2;Prod_1\n\
                       01/03/2024;07:30;A;1;2;10\n\
                       01/03/2024;07:31;B;1;2\n\
                       \n\
                       01/03/2024;07:32;C;1;2;30;40\n\
                       broken\n";
        let outcome = parser.parse_production_file(content.as_bytes());

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.skipped_lines, 2);
        assert_eq!(outcome.rows[1].label, "C");
    }

    #[test]
    fn test_production_caps_quantities_at_forty() {
        let mut fields = vec!["02/03/2024", "08:00", "F", "1", "2"];
        let values: Vec<String> = (1..=45).map(|n| n.to_string()).collect();
        fields.extend(values.iter().map(String::as_str));
        let line = fields.join(";");

        let outcome = RecordParser::new().parse_production_file(line.as_bytes());
        let row = &outcome.rows[0];
        assert_eq!(row.quantities.len(), PRODUCT_SLOTS);
        assert_eq!(row.quantities[39], 40.0);
    }

    #[test]
    fn test_production_lenient_numbers() {
        let outcome = RecordParser::new()
            .parse_production_file(b"01/03/2024,07:30,F,\"7\",x,\"1,5\",abc");
        // comma separator wins, so "1,5" splits into two fields
        let row = &outcome.rows[0];
        assert_eq!(row.code1, Some(7));
        assert_eq!(row.code2, None);
        assert_eq!(row.quantities, vec![0.0, 5.0, 0.0]);

        assert_eq!(lenient_decimal(" \"12,75\" "), 12.75);
        assert_eq!(lenient_decimal("NaN"), 0.0);
        assert_eq!(lenient_decimal(""), 0.0);
    }

    #[test]
    fn test_flow_line_scenario() {
        let parser = RecordParser::new();
        let outcome = parser
            .parse_flow_file(b"01-03-24;08:15;x;y;PROD01;Amendoim Cru;z;w;123,456;v;1");

        assert_eq!(outcome.rows.len(), 1);
        let row = &outcome.rows[0];
        assert_eq!(row.date, "01-03-24");
        assert_eq!(row.time, "08:15");
        assert_eq!(row.product_code, "PROD01");
        assert_eq!(row.product_name, "Amendoim Cru");
        assert!((row.weight - 123.456).abs() < 1e-9);
        assert_eq!(row.scale.as_deref(), Some("1"));
    }

    #[test]
    fn test_flow_short_and_negative_lines_are_skipped() {
        let content = "Dia;Hora;a;b;Codigo;Nome;c;d;Peso;e;Balanca\n\
                       01-03-24;08:15;x;y;P1;Amendoim;z;w;10\n\
                       01-03-24;08:16;x;y;P2;Amendoim;z;w\n\
                       01-03-24;08:17;x;y;P3;Amendoim;z;w;-4;v;3\n\
                       01-03-24;08:18;x;y;P4;Amendoim;z;w;2,5;v;\n";
        let outcome = RecordParser::new().parse_flow_file(content.as_bytes());

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.skipped_lines, 2);
        assert_eq!(outcome.rows[0].scale, None);
        assert_eq!(outcome.rows[1].product_code, "P4");
        assert_eq!(outcome.rows[1].scale, None);
    }

    #[test]
    fn test_parse_file_prefers_expected_kind() {
        let parser = RecordParser::new();
        let content = b"01-03-24;08:15;x;y;PROD01;Amendoim Cru;z;w;5;v;3";

        let flow = parser.parse_file(content, FileKind::Flow);
        assert_eq!(flow.kind, FileKind::Flow);
        assert!(matches!(flow.outcome.rows[0], ParsedRow::Flow(_)));

        let forced = parser.parse_file(content, FileKind::Production);
        assert_eq!(forced.kind, FileKind::Production);
        assert!(matches!(forced.outcome.rows[0], ParsedRow::Production(_)));

        let detected = parser.parse_file(content, FileKind::Unknown);
        assert_eq!(detected.kind, FileKind::Flow);
    }

    #[test]
    fn test_empty_file() {
        let outcome = RecordParser::new().parse_production_file(b"");
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.skipped_lines, 0);
    }
}
