//! Turns a mentioning post into a code fragment and an eval outcome into
//! reply text.

use unicode_segmentation::UnicodeSegmentation;

use crate::post::{FacetFeature, PostRecord};
use crate::value::EvalOutcome;

/// Reply body when both the console buffer and the value are empty.
const NO_OUTPUT_SENTINEL: &str = "✓ (no output)";

/// Strips every reference to the bot from the post text and returns the
/// remaining code fragment, or `None` when nothing is left.
///
/// Mention facets matching `did` are removed first, by byte offset in
/// descending start order so earlier offsets stay valid. Hostile facets with
/// out-of-range or mid-character offsets are skipped. Literal `@handle`
/// occurrences (ASCII case-insensitive, trailing whitespace consumed) are
/// stripped afterwards, with no constraint on the preceding character.
pub fn extract_code(record: &PostRecord, handle: &str, did: &str) -> Option<String> {
    let mut text = record.text.clone();

    let mut removals: Vec<(usize, usize)> = record
        .facets
        .iter()
        .filter(|facet| {
            facet
                .features
                .iter()
                .any(|feature| matches!(feature, FacetFeature::Mention { did: d } if d == did))
        })
        .map(|facet| (facet.index.byte_start, facet.index.byte_end))
        .collect();
    removals.sort_by(|a, b| b.0.cmp(&a.0));

    for (start, end) in removals {
        if start > end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            continue;
        }
        text.replace_range(start..end, "");
    }

    let stripped = strip_handle_mentions(&text, handle);
    let code = stripped.trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// True when `text` contains the literal `@handle` form, ASCII
/// case-insensitive, anywhere (the preceding character is not constrained).
pub fn mentions_handle(text: &str, handle: &str) -> bool {
    let needle = format!("@{handle}");
    let needle = needle.as_bytes();
    let bytes = text.as_bytes();
    if needle.len() > bytes.len() {
        return false;
    }
    (0..=bytes.len() - needle.len())
        .any(|i| bytes[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

fn strip_handle_mentions(text: &str, handle: &str) -> String {
    let needle = format!("@{handle}");
    let needle = needle.as_bytes();
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes.len() - i >= needle.len() && bytes[i..i + needle.len()].eq_ignore_ascii_case(needle)
        {
            i += needle.len();
            while let Some(c) = text[i..].chars().next() {
                if !c.is_whitespace() {
                    break;
                }
                i += c.len_utf8();
            }
            continue;
        }
        let Some(c) = text[i..].chars().next() else {
            break;
        };
        out.push(c);
        i += c.len_utf8();
    }

    out
}

/// Renders an eval outcome as reply text.
pub fn format_result(outcome: &EvalOutcome) -> String {
    if !outcome.success {
        return format!(
            "Error: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }

    let mut parts: Vec<String> = outcome.output.clone();
    if let Some(value) = &outcome.result {
        if !value.is_undefined() {
            parts.push(format!("=> {}", value.render()));
        }
    }

    if parts.is_empty() {
        NO_OUTPUT_SENTINEL.to_string()
    } else {
        parts.join("\n")
    }
}

/// Truncates to `limit` user-perceived characters (grapheme clusters).
///
/// Counting code points or bytes here is a correctness bug: combining marks,
/// emoji ZWJ sequences, and regional-indicator pairs must each count as one.
pub fn truncate_graphemes(text: &str, limit: usize) -> String {
    if text.graphemes(true).count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = text.graphemes(true).take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::{Facet, FacetIndex};
    use crate::value::{EvalOutcome, EvalValue};

    const HANDLE: &str = "bot.example.com";
    const DID: &str = "did:plc:bot";

    fn record(text: &str) -> PostRecord {
        PostRecord {
            text: text.to_string(),
            ..PostRecord::default()
        }
    }

    fn mention_facet(start: usize, end: usize) -> Facet {
        Facet {
            index: FacetIndex {
                byte_start: start,
                byte_end: end,
            },
            features: vec![FacetFeature::Mention {
                did: DID.to_string(),
            }],
        }
    }

    #[test]
    fn detects_handle_mentions() {
        assert!(mentions_handle("@Bot.Example.Com hi", HANDLE));
        assert!(mentions_handle("prefix@bot.example.com", HANDLE));
        assert!(!mentions_handle("@bot.example.co hi", "bot.example.com"));
        assert!(!mentions_handle("", HANDLE));
    }

    #[test]
    fn strips_handle_case_insensitively() {
        let rec = record("@Bot.Example.Com 2 + 2");
        assert_eq!(extract_code(&rec, HANDLE, DID).unwrap(), "2 + 2");
    }

    #[test]
    fn strips_embedded_handle() {
        // The preceding character is intentionally unconstrained.
        let rec = record("foo@bot.example.com bar");
        assert_eq!(extract_code(&rec, HANDLE, DID).unwrap(), "foobar");
    }

    #[test]
    fn strips_facet_mentions_by_descending_offset() {
        // Text forms differ from the configured handle so only the facet
        // ranges are removed.
        let mut rec = record("@other.handle 1 + 1@second.handle");
        rec.facets = vec![mention_facet(0, 13), mention_facet(19, 33)];
        assert_eq!(extract_code(&rec, HANDLE, DID).unwrap(), "1 + 1");
    }

    #[test]
    fn skips_hostile_facet_offsets() {
        let mut rec = record("héllo @bot.example.com 42");
        rec.facets = vec![
            mention_facet(2, 3),    // mid-character
            mention_facet(90, 120), // out of range
            mention_facet(5, 4),    // inverted
        ];
        assert_eq!(extract_code(&rec, HANDLE, DID).unwrap(), "héllo 42");
    }

    #[test]
    fn empty_after_stripping_is_none() {
        let rec = record("@bot.example.com   ");
        assert_eq!(extract_code(&rec, HANDLE, DID), None);
    }

    #[test]
    fn extract_code_is_idempotent() {
        let rec = record("@bot.example.com console.log('hi')");
        let once = extract_code(&rec, HANDLE, DID).unwrap();
        let twice = extract_code(&record(&once), HANDLE, DID).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn formats_value_only() {
        let outcome = EvalOutcome::ok(EvalValue::Int(4), Vec::new());
        assert_eq!(format_result(&outcome), "=> 4");
    }

    #[test]
    fn formats_console_then_value() {
        let outcome = EvalOutcome::ok(
            EvalValue::String("World".into()),
            vec!["Hello".to_string()],
        );
        assert_eq!(format_result(&outcome), "Hello\n=> World");
    }

    #[test]
    fn undefined_value_is_omitted() {
        let outcome = EvalOutcome::ok(EvalValue::Undefined, vec!["side effect".to_string()]);
        assert_eq!(format_result(&outcome), "side effect");
    }

    #[test]
    fn empty_run_yields_sentinel() {
        let outcome = EvalOutcome::ok(EvalValue::Undefined, Vec::new());
        assert_eq!(format_result(&outcome), "✓ (no output)");
    }

    #[test]
    fn formats_error() {
        let outcome = EvalOutcome::err("boom", vec!["partial output".to_string()]);
        assert_eq!(format_result(&outcome), "Error: boom");
    }

    #[test]
    fn truncation_counts_graphemes_not_code_points() {
        // Each family emoji is one grapheme built from many code points.
        let family = "👨‍👩‍👧‍👦";
        let text = family.repeat(350);
        let truncated = truncate_graphemes(&text, 300);

        let graphemes: Vec<&str> = truncated.graphemes(true).collect();
        assert_eq!(graphemes.len(), 300);
        assert!(truncated.ends_with("..."));
        assert_eq!(graphemes[296], family);
    }

    #[test]
    fn short_text_is_unchanged() {
        let text = "héllo 👍 world";
        assert_eq!(truncate_graphemes(text, 300), text);
    }

    #[test]
    fn combining_marks_survive_truncation() {
        // "e" + combining acute, repeated: 10 graphemes, 20 code points.
        let text = "e\u{0301}".repeat(10);
        let truncated = truncate_graphemes(&text, 5);
        assert_eq!(truncated.graphemes(true).count(), 5);
        assert!(truncated.ends_with("..."));
    }
}
