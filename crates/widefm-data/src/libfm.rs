//! The libfm text format.
//!
//! One training example per line:
//!
//! ```text
//! label <sep> (field:)?fea_id(:value)? ...
//! ```
//!
//! Labels are real, feature IDs are 64-bit unsigned, fields and values are
//! optional per token. Separators are any run of spaces or tabs. Feature
//! IDs are byte-reversed on ingest when [`LibfmOptions::reverse_feaid`] is
//! set, so the model's key space is uniform for range sharding; the same
//! transform is undone when dumping a model.

use widefm_core::feaid::{encode_group, reverse_bytes};
use widefm_core::FeaId;


/// Ingest options applied to every parsed feature ID.
#[derive(Debug, Clone, Copy)]
pub struct LibfmOptions {
    /// Apply [`reverse_bytes`] to every feature ID.
    pub reverse_feaid: bool,
    /// When nonzero, pack the token's field ID into the low bits.
    pub fea_group_nbits: u32,
}

impl Default for LibfmOptions {
    fn default() -> Self {
        Self {
            reverse_feaid: true,
            fea_group_nbits: 0,
        }
    }
}

/// One parsed example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// The real-valued label.
    pub label: f32,
    /// Sample weight; 1 unless re-weighted downstream.
    pub weight: f32,
    /// `(field, feature id, value)` triples.
    pub entries: Vec<(u32, FeaId, f32)>,
}

/// Parses one libfm line.
///
/// Returns `Ok(None)` for blank lines. Malformed tokens produce an error
/// message for the caller to attach file/line context to.
pub fn parse_line(line: &str, opts: &LibfmOptions) -> std::result::Result<Option<Example>, String> {
    let mut tokens = line.split_ascii_whitespace();
    let Some(first) = tokens.next() else {
        return Ok(None);
    };
    let label: f32 = first
        .parse()
        .map_err(|_| format!("bad label `{}`", first))?;

    let mut entries = Vec::new();
    for tok in tokens {
        let mut parts = tok.split(':');
        let (field, id_str, val_str) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), None, None) => (0u32, id, None),
            (Some(id), Some(v), None) => (0u32, id, Some(v)),
            (Some(f), Some(id), Some(v)) => {
                let field = f
                    .parse()
                    .map_err(|_| format!("bad field `{}` in `{}`", f, tok))?;
                (field, id, Some(v))
            }
            _ => return Err(format!("bad token `{}`", tok)),
        };
        if parts.next().is_some() {
            return Err(format!("bad token `{}`", tok));
        }
        let mut id: FeaId = id_str
            .parse()
            .map_err(|_| format!("bad feature id `{}` in `{}`", id_str, tok))?;
        if opts.fea_group_nbits > 0 {
            id = encode_group(id, field as u64, opts.fea_group_nbits)
                .map_err(|e| e.to_string())?;
        }
        if opts.reverse_feaid {
            id = reverse_bytes(id);
        }
        let value: f32 = match val_str {
            Some(v) => v.parse().map_err(|_| format!("bad value `{}` in `{}`", v, tok))?,
            None => 1.0,
        };
        entries.push((field, id, value));
    }

    Ok(Some(Example {
        label,
        weight: 1.0,
        entries,
    }))
}
