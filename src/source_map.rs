//! Source positions, position maps and standard (v3) source maps.
//!
//! Loaders assemble their output with a [`SourceBuilder`], which records for
//! every emitted chunk where it came from. The resulting [`PositionMap`]
//! translates into a [`SourceMap`] that downstream consumers understand, and
//! a source map can be embedded into generated text as a base64 data url
//! comment when it cannot travel on a side channel.

use anyhow::{anyhow, Context};
use base64::Engine;
use serde::{Deserialize, Serialize};

const DATA_URL_PREFIX: &str = "data:application/json;base64,";
const BASE64_DIGITS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// A position in a text document. Lines and columns are 1-based; columns
/// count characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub const START: Position = Position { line: 1, column: 1 };

    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// One generated position and the original position it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub generated: Position,
    pub original: Position,
    pub source: String,
}

/// Generated → original positions, ordered by generated position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionMap {
    mappings: Vec<Mapping>,
}

impl PositionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mapping: Mapping) {
        self.mappings.push(mapping);
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Find the mapping covering `generated`: the closest mapping on the same
    /// generated line that starts at or before it.
    pub fn original_position_for(&self, generated: Position) -> Option<&Mapping> {
        self.mappings
            .iter()
            .filter(|m| m.generated.line == generated.line && m.generated.column <= generated.column)
            .max_by_key(|m| m.generated.column)
    }

    /// Encode as a standard source map.
    pub fn to_source_map(&self, file: Option<&str>) -> SourceMap {
        let mut mappings = self.mappings.clone();
        mappings.sort_by_key(|m| m.generated);

        let mut sources: Vec<String> = Vec::new();
        let mut encoded = String::new();
        let mut line = 1;
        let mut first_in_line = true;
        let mut prev_column = 0i64;
        let mut prev_source = 0i64;
        let mut prev_original_line = 0i64;
        let mut prev_original_column = 0i64;

        for mapping in &mappings {
            while line < mapping.generated.line {
                encoded.push(';');
                line += 1;
                first_in_line = true;
                prev_column = 0;
            }
            if !first_in_line {
                encoded.push(',');
            }
            first_in_line = false;

            let source_index = match sources.iter().position(|s| *s == mapping.source) {
                Some(index) => index,
                None => {
                    sources.push(mapping.source.clone());
                    sources.len() - 1
                }
            };
            let source = source_index as i64;
            let column = i64::from(mapping.generated.column) - 1;
            let original_line = i64::from(mapping.original.line) - 1;
            let original_column = i64::from(mapping.original.column) - 1;

            encode_vlq(&mut encoded, column - prev_column);
            encode_vlq(&mut encoded, source - prev_source);
            encode_vlq(&mut encoded, original_line - prev_original_line);
            encode_vlq(&mut encoded, original_column - prev_original_column);

            prev_column = column;
            prev_source = source;
            prev_original_line = original_line;
            prev_original_column = original_column;
        }

        SourceMap {
            version: 3,
            file: file.map(str::to_string),
            sources,
            names: vec![],
            mappings: encoded,
        }
    }
}

/// A version 3 source map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `data:application/json;base64,…` form of the map.
    pub fn to_data_url(&self) -> anyhow::Result<String> {
        let json = self.to_json()?;
        Ok(format!(
            "{}{}",
            DATA_URL_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(json.as_bytes())
        ))
    }

    /// A block comment carrying the map, suitable for appending to inlined
    /// script or style text.
    pub fn inline_comment(&self) -> anyhow::Result<String> {
        Ok(format!("/*# sourceMappingURL={} */", self.to_data_url()?))
    }

    pub fn from_data_url(data_url: &str) -> anyhow::Result<Self> {
        let encoded = data_url
            .strip_prefix(DATA_URL_PREFIX)
            .ok_or_else(|| anyhow!("not a base64 JSON data url"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("invalid base64 in source map data url")?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Find the first inline source map comment in `text`.
    pub fn extract_inline(text: &str) -> Option<anyhow::Result<Self>> {
        let start = text.find("sourceMappingURL=")? + "sourceMappingURL=".len();
        let rest = &text[start..];
        let end = rest.find(|c: char| c.is_whitespace() || c == '*').unwrap_or(rest.len());
        Some(Self::from_data_url(&rest[..end]))
    }

    /// Decode the VLQ mappings back into positions.
    pub fn decode(&self) -> anyhow::Result<PositionMap> {
        let mut map = PositionMap::new();
        let mut source = 0i64;
        let mut original_line = 0i64;
        let mut original_column = 0i64;

        for (line_index, line) in self.mappings.split(';').enumerate() {
            let mut column = 0i64;
            for segment in line.split(',').filter(|s| !s.is_empty()) {
                let fields = decode_vlq_segment(segment)?;
                column += fields[0];
                if fields.len() < 4 {
                    continue;
                }
                source += fields[1];
                original_line += fields[2];
                original_column += fields[3];

                let source_uri = usize::try_from(source)
                    .ok()
                    .and_then(|i| self.sources.get(i))
                    .ok_or_else(|| anyhow!("mapping refers to unknown source {}", source))?;

                map.push(Mapping {
                    generated: Position::new(line_index as u32 + 1, to_u32(column)? + 1),
                    original: Position::new(to_u32(original_line)? + 1, to_u32(original_column)? + 1),
                    source: source_uri.clone(),
                });
            }
        }
        Ok(map)
    }
}

fn to_u32(value: i64) -> anyhow::Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("negative position in source map: {}", value))
}

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 { ((-value) << 1) | 1 } else { value << 1 };
    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64_DIGITS[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

fn decode_vlq_segment(segment: &str) -> anyhow::Result<Vec<i64>> {
    let mut values = Vec::with_capacity(4);
    let mut value = 0i64;
    let mut shift = 0;

    for byte in segment.bytes() {
        let digit = BASE64_DIGITS
            .iter()
            .position(|&d| d == byte)
            .ok_or_else(|| anyhow!("invalid VLQ digit '{}'", byte as char))? as i64;
        value += (digit & 0b11111) << shift;
        if digit & 0b100000 != 0 {
            shift += 5;
            if shift >= 60 {
                return Err(anyhow!("VLQ value overflows in segment '{}'", segment));
            }
            continue;
        }
        let negative = value & 1 == 1;
        value >>= 1;
        values.push(if negative { -value } else { value });
        value = 0;
        shift = 0;
    }

    if shift != 0 {
        return Err(anyhow!("truncated VLQ segment '{}'", segment));
    }
    Ok(values)
}

/// Concatenates output text while recording where each chunk came from.
#[derive(Debug)]
pub struct SourceBuilder {
    source: String,
    code: String,
    line: u32,
    column: u32,
    map: PositionMap,
}

impl SourceBuilder {
    /// Start building output whose original positions all refer to `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            code: String::new(),
            line: 1,
            column: 1,
            map: PositionMap::new(),
        }
    }

    /// Append text copied unchanged from `origin`; every line maps to its
    /// own original line.
    pub fn push_verbatim(&mut self, text: &str, origin: Position) {
        self.push_lines(text, Some(origin), true);
    }

    /// Append text generated from the construct at `origin`; every line maps
    /// back to `origin`.
    pub fn push_mapped(&mut self, text: &str, origin: Position) {
        self.push_lines(text, Some(origin), false);
    }

    /// Append text with no original position.
    pub fn push_unmapped(&mut self, text: &str) {
        self.push_lines(text, None, false);
    }

    fn push_lines(&mut self, text: &str, origin: Option<Position>, verbatim: bool) {
        for (offset, segment) in text.split('\n').enumerate() {
            if offset > 0 {
                self.code.push('\n');
                self.line += 1;
                self.column = 1;
            }
            if segment.is_empty() {
                continue;
            }
            if let Some(origin) = origin {
                let original = match (offset, verbatim) {
                    (0, _) | (_, false) => origin,
                    (n, true) => Position::new(origin.line + n as u32, 1),
                };
                self.map.push(Mapping {
                    generated: Position::new(self.line, self.column),
                    original,
                    source: self.source.clone(),
                });
            }
            self.code.push_str(segment);
            self.column += segment.chars().count() as u32;
        }
    }

    pub fn finish(self) -> (String, PositionMap) {
        (self.code, self.map)
    }
}
