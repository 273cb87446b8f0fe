//! Structured block extraction.
//!
//! Splits free-form assistant markdown into ordered segments, pulling out
//! fenced chart blocks (JSON payloads) and generic code blocks. The scan is a
//! single left-to-right pass that is re-run on every text mutation; it is safe
//! to call on partial input while a stream is still arriving.

use crate::constants::{CHART_FENCE_OPEN, FENCE};
use crate::str_utils;
use crate::types::{ChartRecord, ChartSpec, ContentSegment};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref JSON_OBJECT_RE: Regex = Regex::new(r"(?s)\{.*\}").expect("Invalid chart JSON regex");
    static ref LANGUAGE_TAG_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_+#.\-]+$").expect("Invalid language tag regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Chart,
    Code,
}

/// A chart block whose payload could not be turned into a `ChartSpec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractFailure {
    /// Byte offset of the opening fence in the trimmed input.
    pub offset: usize,
    /// The raw block, fences included.
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub segments: Vec<ContentSegment>,
    pub failures: Vec<ExtractFailure>,
    /// Set when the scan stopped at a block whose closing fence has not
    /// arrived yet. Everything from that block onward was left out.
    pub withheld: bool,
}

impl Extraction {
    pub fn charts(&self) -> impl Iterator<Item = &ChartSpec> {
        self.segments.iter().filter_map(|s| match s {
            ContentSegment::Chart { payload } => Some(payload),
            _ => None,
        })
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            ContentSegment::Code { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn has_structured(&self) -> bool {
        self.segments.iter().any(ContentSegment::is_structured)
    }
}

/// Scans `text` and returns its ordered segments.
///
/// With `is_complete == false` an unterminated block hides itself and all
/// text after it, and chart/code segments are not emitted at all. With
/// `is_complete == true` an unterminated block degrades to raw markdown.
pub fn extract_segments(text: &str, is_complete: bool) -> Extraction {
    let text = text.trim();
    let mut out = Extraction::default();
    let mut cursor = 0;

    loop {
        let rest = &text[cursor..];
        let chart_at = rest.find(CHART_FENCE_OPEN);
        let fence_at = rest.find(FENCE);

        // The generic search also lands on a chart opener, so ties go to the chart.
        let (kind, rel_start) = match (chart_at, fence_at) {
            (Some(c), Some(f)) if c <= f => (BlockKind::Chart, c),
            (_, Some(f)) => (BlockKind::Code, f),
            (Some(c), None) => (BlockKind::Chart, c),
            (None, None) => break,
        };

        let start = cursor + rel_start;
        push_markdown(&mut out.segments, text[cursor..start].trim_end());

        let open_len = match kind {
            BlockKind::Chart => CHART_FENCE_OPEN.len(),
            BlockKind::Code => FENCE.len(),
        };
        let body_start = start + open_len;

        let body_end = match text[body_start..].find(FENCE) {
            Some(rel) => body_start + rel,
            None => {
                if is_complete {
                    out.segments
                        .push(ContentSegment::markdown(&text[start..]));
                } else {
                    out.withheld = true;
                }
                return out;
            }
        };
        let block_end = body_end + FENCE.len();
        let inner = &text[body_start..body_end];

        match kind {
            BlockKind::Chart => match parse_chart_block(inner) {
                Ok(chart) => {
                    if is_complete {
                        out.segments.push(ContentSegment::Chart { payload: chart });
                    }
                }
                Err(reason) => {
                    let raw = &text[start..block_end];
                    if is_complete {
                        tracing::warn!(
                            offset = start,
                            "[EXTRACT] Chart block failed to parse: {} | content: {}",
                            reason,
                            str_utils::snippet(inner, 200)
                        );
                    } else {
                        tracing::debug!(
                            offset = start,
                            "[EXTRACT] Chart block not parseable yet: {}",
                            reason
                        );
                    }
                    out.failures.push(ExtractFailure {
                        offset: start,
                        raw: raw.to_string(),
                        reason,
                    });
                    out.segments.push(ContentSegment::markdown(raw));
                }
            },
            BlockKind::Code => {
                if is_complete {
                    out.segments.push(code_segment(inner));
                }
            }
        }

        cursor = block_end;
    }

    if cursor < text.len() {
        let tail = text[cursor..].trim();
        let tail = if is_complete {
            tail
        } else {
            str_utils::trim_partial_fence(tail)
        };
        push_markdown(&mut out.segments, tail);
    }

    out
}

fn push_markdown(segments: &mut Vec<ContentSegment>, text: &str) {
    if !text.trim().is_empty() {
        segments.push(ContentSegment::markdown(text));
    }
}

fn code_segment(inner: &str) -> ContentSegment {
    // An info string sits directly after the fence, alone on its line.
    if let Some((first_line, body)) = inner.split_once('\n') {
        let tag = first_line.trim_end();
        if !tag.is_empty() && !inner.starts_with(char::is_whitespace) && LANGUAGE_TAG_RE.is_match(tag)
        {
            return ContentSegment::Code {
                text: body.trim().to_string(),
                language: Some(tag.to_string()),
            };
        }
    }
    ContentSegment::Code {
        text: inner.trim().to_string(),
        language: None,
    }
}

/// Parses the inside of a chart fence. Tolerates text around the JSON object,
/// e.g. a stray language line.
pub fn parse_chart_block(inner: &str) -> std::result::Result<ChartSpec, String> {
    let trimmed = inner.trim();
    let json = if trimmed.starts_with('{') {
        trimmed
    } else {
        match JSON_OBJECT_RE.find(trimmed) {
            Some(m) => m.as_str(),
            None => trimmed,
        }
    };

    let chart: ChartSpec = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(normalize_chart(chart))
}

/// Fills in the keys renderers rely on.
///
/// Records missing `dataKey` get it aliased from their first numeric field.
/// A missing `nameKey` falls back to the first string field of the first
/// record, and `xAxisKey` follows `nameKey` when absent.
pub fn normalize_chart(mut chart: ChartSpec) -> ChartSpec {
    for record in chart.data.iter_mut() {
        alias_data_key(record, &chart.data_key);
    }

    if chart.name_key.is_none() {
        chart.name_key = chart.data.first().and_then(|first| {
            first
                .iter()
                .find(|(_, v)| v.is_string())
                .map(|(k, _)| k.clone())
        });
    }

    if chart.x_axis_key.is_none() {
        chart.x_axis_key = chart.name_key.clone();
    }

    chart
}

fn alias_data_key(record: &mut ChartRecord, data_key: &str) {
    if record.contains_key(data_key) {
        return;
    }
    let candidate = record
        .iter()
        .find(|(_, v)| v.is_number())
        .map(|(_, v)| v.clone());
    if let Some(value) = candidate {
        record.insert(data_key.to_string(), value);
    }
}

/// Non-blocking diagnostics for a normalized chart.
pub fn validate_chart(chart: &ChartSpec) -> Vec<String> {
    let mut warnings = Vec::new();

    if chart.kind.trim().is_empty() {
        warnings.push("Missing 'type' property".to_string());
    }
    if chart.title.as_deref().map(str::trim).unwrap_or("").is_empty() {
        warnings.push("Missing 'title' property".to_string());
    }
    if chart.data_key.trim().is_empty() {
        warnings.push("Missing 'dataKey' property".to_string());
    }
    match chart.data.first() {
        None => warnings.push("Empty data array".to_string()),
        Some(first) => {
            if !first.contains_key(&chart.data_key) {
                warnings.push(format!(
                    "Data items missing '{}' property",
                    chart.data_key
                ));
            }
        }
    }
    if let Some(height) = chart.height {
        if height < 200.0 {
            warnings.push("Invalid height (should be number >= 200)".to_string());
        }
    }

    warnings
}
