//! Structure-aware segmenter.
//!
//! Splits redacted file text into bounded segments. Units start at structural
//! boundaries (function/class starts for code, headings for documents) and are
//! packed greedily. A unit larger than the budget falls back to fixed windows,
//! and a single line longer than the budget is cut at char boundaries. Each
//! segment after the first carries the trailing lines of its predecessor.
//!
//! Every segment's text, overlap included, is at most `max_chars` characters.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;

static CODE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:def|class|fn|impl|struct|enum|trait|mod|function|interface|func|module)\b",
    )
    .expect("valid code boundary regex")
});

static DOCUMENT_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").expect("valid heading regex"));

/// What a segment holds. Chosen from the source file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Code,
    Document,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    fn boundary(&self) -> &'static Regex {
        match self {
            Self::Code => &CODE_BOUNDARY,
            Self::Document => &DOCUMENT_BOUNDARY,
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub max_chars: usize,
    pub overlap_lines: usize,
    pub max_overlap_chars: usize,
}

impl From<&ChunkingConfig> for SegmentOptions {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            overlap_lines: config.overlap_lines,
            max_overlap_chars: config.max_overlap_chars,
        }
    }
}

impl SegmentOptions {
    fn overlap_enabled(&self) -> bool {
        self.overlap_lines > 0 && self.max_overlap_chars > 0
    }

    /// Characters available to a segment's own lines.
    fn body_budget(&self) -> usize {
        if self.overlap_enabled() {
            self.max_chars.saturating_sub(self.max_overlap_chars + 1).max(1)
        } else {
            self.max_chars.max(1)
        }
    }
}

/// One segment before it is content-addressed. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCandidate {
    pub seq: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// A slice of one source line. Lines longer than the budget yield several pieces.
#[derive(Debug, Clone, Copy)]
struct Piece<'a> {
    line: usize,
    text: &'a str,
    line_start: bool,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Joined length of `pieces` with a newline between each.
fn joined_len(pieces: &[Piece<'_>]) -> usize {
    pieces.iter().map(|p| char_len(p.text)).sum::<usize>() + pieces.len().saturating_sub(1)
}

fn to_pieces(text: &str, budget: usize) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if char_len(line) <= budget {
            pieces.push(Piece {
                line: line_no,
                text: line,
                line_start: true,
            });
            continue;
        }
        let mut first = true;
        let mut start = 0;
        let mut count = 0;
        for (byte_idx, _) in line.char_indices() {
            if count == budget {
                pieces.push(Piece {
                    line: line_no,
                    text: &line[start..byte_idx],
                    line_start: first,
                });
                first = false;
                start = byte_idx;
                count = 0;
            }
            count += 1;
        }
        pieces.push(Piece {
            line: line_no,
            text: &line[start..],
            line_start: first,
        });
    }
    pieces
}

/// Group pieces into structural units: a unit starts at each boundary line.
fn to_units<'a>(pieces: &[Piece<'a>], kind: SegmentKind) -> Vec<Vec<Piece<'a>>> {
    let boundary = kind.boundary();
    let mut units: Vec<Vec<Piece<'a>>> = Vec::new();
    let mut current: Vec<Piece<'a>> = Vec::new();
    for piece in pieces {
        if piece.line_start && !current.is_empty() && boundary.is_match(piece.text) {
            units.push(std::mem::take(&mut current));
        }
        current.push(*piece);
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

/// Split `text` into ordered segments. Whitespace-only input yields none.
pub fn segment(text: &str, kind: SegmentKind, opts: &SegmentOptions) -> Vec<SegmentCandidate> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let budget = opts.body_budget();
    let pieces = to_pieces(text, budget);
    let units = to_units(&pieces, kind);

    // Greedy packing of whole units; oversized units become fixed windows.
    let mut bodies: Vec<Vec<Piece<'_>>> = Vec::new();
    let mut current: Vec<Piece<'_>> = Vec::new();
    for unit in units {
        let unit_len = joined_len(&unit);
        if unit_len > budget {
            if !current.is_empty() {
                bodies.push(std::mem::take(&mut current));
            }
            let mut window: Vec<Piece<'_>> = Vec::new();
            for piece in unit {
                window.push(piece);
                if joined_len(&window) > budget {
                    window.pop();
                    if !window.is_empty() {
                        bodies.push(std::mem::take(&mut window));
                    }
                    window.push(piece);
                }
            }
            if !window.is_empty() {
                bodies.push(window);
            }
            continue;
        }

        let combined = if current.is_empty() {
            unit_len
        } else {
            joined_len(&current) + 1 + unit_len
        };
        if combined > budget && !current.is_empty() {
            bodies.push(std::mem::take(&mut current));
        }
        current.extend(unit);
    }
    if !current.is_empty() {
        bodies.push(current);
    }

    bodies.retain(|body| body.iter().any(|p| !p.text.trim().is_empty()));

    let mut segments = Vec::with_capacity(bodies.len());
    for (seq, body) in bodies.iter().enumerate() {
        let overlap = if seq > 0 && opts.overlap_enabled() {
            overlap_tail(&bodies[seq - 1], opts)
        } else {
            &[]
        };

        let mut all: Vec<Piece<'_>> = Vec::with_capacity(overlap.len() + body.len());
        all.extend_from_slice(overlap);
        all.extend_from_slice(body);

        let text = all.iter().map(|p| p.text).collect::<Vec<_>>().join("\n");
        segments.push(SegmentCandidate {
            seq,
            start_line: all[0].line,
            end_line: all[all.len() - 1].line,
            text,
        });
    }
    segments
}

/// Trailing pieces of the previous body, at most `overlap_lines` of them and
/// at most `max_overlap_chars` characters in total.
fn overlap_tail<'p, 'a>(prev: &'p [Piece<'a>], opts: &SegmentOptions) -> &'p [Piece<'a>] {
    let mut take = 0;
    while take < opts.overlap_lines && take < prev.len() {
        let candidate = &prev[prev.len() - take - 1..];
        if joined_len(candidate) > opts.max_overlap_chars {
            break;
        }
        take += 1;
    }
    &prev[prev.len() - take..]
}
