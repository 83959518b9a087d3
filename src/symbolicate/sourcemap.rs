//! Source map (revision 3) parsing and position lookup.
//!
//! Only the pieces needed to map a generated position back to its original
//! source are implemented: `sources`, `sourceRoot`, `names` and the VLQ
//! encoded `mappings` string. Indexed maps (`sections`) are rejected.

use serde::Deserialize;

use super::SourceMapError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    mappings: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    generated_column: u32,
    original: Option<OriginalRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OriginalRef {
    source: u32,
    line: u32,
    column: u32,
    name: Option<u32>,
}

/// An original source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalLocation<'a> {
    pub source: &'a str,
    /// 1-based line.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
    pub name: Option<&'a str>,
}

/// Parsed, queryable source map.
#[derive(Debug, Clone)]
pub struct SourceMap {
    sources: Vec<String>,
    names: Vec<String>,
    /// Segments per generated line, sorted by generated column.
    lines: Vec<Vec<Segment>>,
}

impl SourceMap {
    /// Parses a source map from its JSON text.
    pub fn parse(text: &str) -> Result<Self, SourceMapError> {
        // Maps served over HTTP may carry an XSSI guard prefix.
        let text = text.strip_prefix(")]}'").unwrap_or(text);
        let raw: RawSourceMap = serde_json::from_str(text)?;

        if raw.version != 3 {
            return Err(SourceMapError::UnsupportedVersion(raw.version));
        }
        let mappings = raw
            .mappings
            .ok_or_else(|| SourceMapError::InvalidMappings("missing mappings".to_string()))?;

        let root = raw
            .source_root
            .filter(|r| !r.is_empty())
            .map(|r| if r.ends_with('/') { r } else { format!("{r}/") });
        let sources = raw
            .sources
            .into_iter()
            .map(|s| {
                let s = s.unwrap_or_default();
                match &root {
                    Some(root) => format!("{root}{s}"),
                    None => s,
                }
            })
            .collect::<Vec<_>>();

        let lines = decode_mappings(&mappings, sources.len(), raw.names.len())?;

        Ok(Self {
            sources,
            names: raw.names,
            lines,
        })
    }

    /// Original position for a generated position.
    ///
    /// `line` is 1-based, `column` 0-based. The closest segment at or before
    /// the column on the same line wins.
    pub fn lookup(&self, line: u32, column: u32) -> Option<OriginalLocation<'_>> {
        let segments = self.lines.get(usize::try_from(line.checked_sub(1)?).ok()?)?;
        let idx = segments.partition_point(|s| s.generated_column <= column);
        let segment = segments.get(idx.checked_sub(1)?)?;
        let original = segment.original?;

        Some(OriginalLocation {
            source: self.sources.get(original.source as usize)?.as_str(),
            line: original.line + 1,
            column: original.column,
            name: original
                .name
                .and_then(|n| self.names.get(n as usize))
                .map(String::as_str),
        })
    }

    /// Number of generated lines with mapping data.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

fn decode_mappings(
    mappings: &str,
    source_count: usize,
    name_count: usize,
) -> Result<Vec<Vec<Segment>>, SourceMapError> {
    let mut lines = Vec::new();

    let mut source: i64 = 0;
    let mut original_line: i64 = 0;
    let mut original_column: i64 = 0;
    let mut name: i64 = 0;

    for line in mappings.split(';') {
        let mut generated_column: i64 = 0;
        let mut segments = Vec::new();

        for raw in line.split(',').filter(|s| !s.is_empty()) {
            let fields = decode_vlq_segment(raw)?;
            generated_column += fields[0];

            let original = match fields.len() {
                1 => None,
                4 | 5 => {
                    source += fields[1];
                    original_line += fields[2];
                    original_column += fields[3];
                    let name_idx = if fields.len() == 5 {
                        name += fields[4];
                        Some(checked_index(name, name_count, "name")?)
                    } else {
                        None
                    };
                    Some(OriginalRef {
                        source: checked_index(source, source_count, "source")?,
                        line: non_negative(original_line, "original line")?,
                        column: non_negative(original_column, "original column")?,
                        name: name_idx,
                    })
                }
                n => {
                    return Err(SourceMapError::InvalidMappings(format!(
                        "segment {raw:?} has {n} fields"
                    )))
                }
            };

            segments.push(Segment {
                generated_column: non_negative(generated_column, "generated column")?,
                original,
            });
        }

        segments.sort_by_key(|s| s.generated_column);
        lines.push(segments);
    }

    Ok(lines)
}

fn checked_index(value: i64, len: usize, what: &str) -> Result<u32, SourceMapError> {
    let idx = non_negative(value, what)?;
    if idx as usize >= len {
        return Err(SourceMapError::InvalidMappings(format!(
            "{what} index {idx} out of range"
        )));
    }
    Ok(idx)
}

fn non_negative(value: i64, what: &str) -> Result<u32, SourceMapError> {
    u32::try_from(value)
        .map_err(|_| SourceMapError::InvalidMappings(format!("{what} {value} out of range")))
}

fn base64_value(c: u8) -> Option<i64> {
    let v = match c {
        b'A'..=b'Z' => c - b'A',
        b'a'..=b'z' => c - b'a' + 26,
        b'0'..=b'9' => c - b'0' + 52,
        b'+' => 62,
        b'/' => 63,
        _ => return None,
    };
    Some(i64::from(v))
}

/// Decodes one comma-separated segment into its signed VLQ fields.
fn decode_vlq_segment(segment: &str) -> Result<Vec<i64>, SourceMapError> {
    let mut fields = Vec::with_capacity(5);
    let mut value: i64 = 0;
    let mut shift = 0u32;
    let mut pending = false;

    for &c in segment.as_bytes() {
        let digit = base64_value(c).ok_or_else(|| {
            SourceMapError::InvalidMappings(format!("invalid base64 character {:?}", c as char))
        })?;
        if shift > 60 {
            return Err(SourceMapError::InvalidMappings("VLQ value overflow".to_string()));
        }

        value |= (digit & 0x1f) << shift;
        if digit & 0x20 != 0 {
            shift += 5;
            pending = true;
            continue;
        }

        let negative = value & 1 == 1;
        let magnitude = value >> 1;
        fields.push(if negative { -magnitude } else { magnitude });
        value = 0;
        shift = 0;
        pending = false;
    }

    if pending {
        return Err(SourceMapError::InvalidMappings(format!(
            "truncated VLQ segment {segment:?}"
        )));
    }
    Ok(fields)
}
