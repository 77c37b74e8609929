use crate::agent::types::{MalformedResponse, TradingDecision};

/// Reasoning trace plus the decoded decision array.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub cot_trace: String,
    pub decisions: Vec<TradingDecision>,
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\u{201C}' | '\u{201D}' | '\u{FF02}')
}

/// Byte offset of the `]` closing the `[` at `open`, skipping brackets that
/// sit inside string literals.
pub fn find_matching_bracket(text: &str, open: usize) -> Option<usize> {
    find_closing(text, open, '[', ']')
}

/// Same as [`find_matching_bracket`] for a `{` object.
pub fn find_matching_brace(text: &str, open: usize) -> Option<usize> {
    find_closing(text, open, '{', '}')
}

fn find_closing(text: &str, open: usize, opener: char, closer: char) -> Option<usize> {
    if !text.get(open..).is_some_and(|rest| rest.starts_with(opener)) {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if is_quote(c) {
                in_string = false;
            }
            continue;
        }

        if is_quote(c) {
            in_string = true;
        } else if c == opener {
            depth += 1;
        } else if c == closer {
            depth -= 1;
            if depth == 0 {
                return Some(open + offset);
            }
        }
    }

    None
}

/// Replaces smart and full-width quotation marks with their ASCII forms.
pub fn normalize_quotes(json: &str) -> String {
    json.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{FF02}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// True when the text after `[` opens an object, i.e. the array is shaped
/// like a decision batch rather than prose in brackets.
fn opens_object_array(candidate: &str) -> bool {
    candidate[1..].trim_start().starts_with('{')
}

/// Splits a raw model response into its reasoning trace and decision array.
///
/// Each top-level `[` is tried in order as the start of the array; the first
/// balanced candidate that decodes wins and the text before it becomes the
/// trace. Brackets nested inside a rejected candidate are never tried. A
/// candidate that opens an array of objects but fails to decode ends the
/// search, so a broken batch is reported rather than skipped.
pub fn parse_response(raw: &str) -> Result<ParsedResponse, MalformedResponse> {
    // (reason, fragment, start of the rejected candidate)
    let mut failure: Option<(String, String, usize)> = None;
    let mut resume_at = 0;

    for (start, _) in raw.match_indices('[') {
        if start < resume_at {
            continue;
        }

        let Some(end) = find_matching_bracket(raw, start) else {
            let rest = &raw[start..];
            if opens_object_array(rest) {
                failure = Some(("unterminated JSON array".to_string(), rest.to_string(), start));
                break;
            }
            failure.get_or_insert_with(|| {
                ("unterminated JSON array".to_string(), rest.to_string(), start)
            });
            continue;
        };

        let candidate = &raw[start..=end];
        match serde_json::from_str::<Vec<TradingDecision>>(&normalize_quotes(candidate)) {
            Ok(decisions) => {
                return Ok(ParsedResponse {
                    cot_trace: raw[..start].trim().to_string(),
                    decisions,
                });
            }
            Err(e) => {
                let rejected = (format!("JSON decode failed: {e}"), candidate.to_string(), start);
                if opens_object_array(candidate) {
                    failure = Some(rejected);
                    break;
                }
                failure.get_or_insert(rejected);
                resume_at = end + 1;
            }
        }
    }

    Err(match failure {
        Some((reason, fragment, start)) => MalformedResponse {
            reason,
            fragment: Some(fragment),
            cot_trace: raw[..start].trim().to_string(),
        },
        None => MalformedResponse {
            reason: "no JSON array found in response".to_string(),
            fragment: None,
            cot_trace: raw.trim().to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_reasoning_from_array() {
        let raw = "Some reasoning.\n[{\"symbol\":\"BTCUSDT\",\"action\":\"open_long\",\"leverage\":60,\"position_size_usd\":5000,\"stop_loss\":92000,\"take_profit\":98000,\"confidence\":85,\"risk_usd\":200,\"reasoning\":\"breakout\"}]";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.cot_trace, "Some reasoning.");
        assert_eq!(parsed.decisions.len(), 1);
        assert_eq!(parsed.decisions[0].leverage, Some(60));
    }

    #[test]
    fn parsing_is_repeatable() {
        let raw = "think\n[{\"symbol\":\"ETHUSDT\",\"action\":\"hold\",\"reasoning\":\"trend intact\"}]";
        assert_eq!(parse_response(raw), parse_response(raw));
    }

    #[test]
    fn skips_bracket_inside_reasoning() {
        let raw = "Levels to watch [support 180, resistance 190] hold.\n\
                   [{\"symbol\":\"SOLUSDT\",\"action\":\"wait\",\"reasoning\":\"range [180-190]\"}]";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(
            parsed.cot_trace,
            "Levels to watch [support 180, resistance 190] hold."
        );
        assert_eq!(parsed.decisions[0].reasoning, "range [180-190]");
    }

    #[test]
    fn bracket_match_ignores_string_contents() {
        let text = r#"[{"reasoning":"a ] b [ c"}] tail"#;
        let end = find_matching_bracket(text, 0).unwrap();
        assert_eq!(&text[end + 1..], " tail");
    }

    #[test]
    fn brace_match_skips_nested_and_quoted() {
        let text = r#"see {"a":{"b":"}"}} after"#;
        let end = find_matching_brace(text, 4).unwrap();
        assert_eq!(&text[end + 1..], " after");
        assert_eq!(find_matching_brace(text, 0), None);
    }

    #[test]
    fn normalizes_smart_quotes() {
        let raw = "ok\n[{\u{201C}symbol\u{201D}:\u{201C}ETHUSDT\u{201D},\u{201C}action\u{201D}:\u{201C}close_long\u{201D},\u{201C}reasoning\u{201D}:\u{201C}lock in it\u{2019}s gain\u{201D}}]";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.decisions[0].symbol, "ETHUSDT");
        assert_eq!(parsed.decisions[0].reasoning, "lock in it's gain");
    }

    #[test]
    fn full_width_quotes_decode() {
        let raw = "[{\u{FF02}symbol\u{FF02}:\u{FF02}BNBUSDT\u{FF02},\u{FF02}action\u{FF02}:\u{FF02}wait\u{FF02}}]";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.cot_trace, "");
        assert_eq!(parsed.decisions[0].action, "wait");
    }

    #[test]
    fn missing_array_keeps_trace() {
        let err = parse_response("  Market is choppy, nothing to do.  ").unwrap_err();
        assert_eq!(err.cot_trace, "Market is choppy, nothing to do.");
        assert!(err.fragment.is_none());
    }

    #[test]
    fn decode_failure_reports_fragment() {
        let raw = "Reasoning here\n[{\"symbol\": \"BTCUSDT\", \"action\": }]";
        let err = parse_response(raw).unwrap_err();
        assert_eq!(err.cot_trace, "Reasoning here");
        assert_eq!(
            err.fragment.as_deref(),
            Some("[{\"symbol\": \"BTCUSDT\", \"action\": }]")
        );
        assert!(err.reason.starts_with("JSON decode failed"));
    }

    #[test]
    fn unterminated_array_is_malformed() {
        let err = parse_response("trace [{\"symbol\":\"BTCUSDT\"").unwrap_err();
        assert_eq!(err.cot_trace, "trace");
        assert_eq!(err.reason, "unterminated JSON array");
    }

    #[test]
    fn broken_batch_with_brackets_in_strings_is_malformed() {
        let raw = "Reasoning\n[{\"symbol\":\"BTCUSDT\",\"action\":\"hold\",\"reasoning\":\"no stops []\"},]";
        let err = parse_response(raw).unwrap_err();
        assert_eq!(err.cot_trace, "Reasoning");
        assert!(err.reason.starts_with("JSON decode failed"));
        assert_eq!(err.fragment.as_deref(), Some(&raw["Reasoning\n".len()..]));
    }

    #[test]
    fn unterminated_batch_does_not_fall_back_to_inner_brackets() {
        let raw = "trace\n[{\"symbol\":\"SOLUSDT\",\"action\":\"wait\",\"reasoning\":\"range []\"}";
        let err = parse_response(raw).unwrap_err();
        assert_eq!(err.reason, "unterminated JSON array");
        assert_eq!(err.cot_trace, "trace");
    }

    #[test]
    fn stray_unterminated_bracket_in_trace_is_skipped() {
        let raw = "Price [near resistance.\n[{\"symbol\":\"ETHUSDT\",\"action\":\"hold\"}]";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.cot_trace, "Price [near resistance.");
        assert_eq!(parsed.decisions[0].symbol, "ETHUSDT");
    }

    #[test]
    fn rejected_batch_is_reported_over_earlier_prose_bracket() {
        let raw = "Range [180-190] holds.\n[{\"symbol\":\"SOLUSDT\",\"action\":\"wait\",}]";
        let err = parse_response(raw).unwrap_err();
        assert_eq!(err.cot_trace, "Range [180-190] holds.");
        assert!(err.fragment.unwrap().starts_with("[{\"symbol\":\"SOLUSDT\""));
    }

    #[test]
    fn empty_array_is_valid() {
        let parsed = parse_response("Nothing worth trading.\n[]").unwrap();
        assert!(parsed.decisions.is_empty());
    }
}
