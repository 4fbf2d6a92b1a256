//! Extraction of complete CoT messages from the inbound text buffer.

use regex::Regex;
use std::sync::LazyLock;

/// C0 controls other than tab and line feed, plus DEL and the C1 block.
static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0B-\x1F\x7F-\x9F]").expect("valid control-char pattern"));

/// First `<event ...>` through the nearest `</event>`.
static EVENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<event[ >].*?</event>").expect("valid event pattern"));

/// One complete message and the text that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCot {
    pub event: String,
    pub remainder: String,
}

/// Finds the next complete `<event>` in `buffer`.
///
/// Control characters are stripped first and anything before the message is
/// dropped. Returns `None` when no complete message is buffered yet; the
/// caller keeps the buffer and appends the next read to it.
pub fn find_cot(buffer: &str) -> Option<PartialCot> {
    let cleaned = CONTROL_CHARS.replace_all(buffer, "");
    let found = EVENT.find(&cleaned)?;

    Some(PartialCot {
        event: found.as_str().to_string(),
        remainder: cleaned[found.end()..].to_string(),
    })
}

/// Runs [`find_cot`] until the buffer holds no further complete message.
///
/// Returns the extracted messages in order. `buffer` is left holding the
/// unconsumed tail.
pub fn drain_messages(buffer: &mut String) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(partial) = find_cot(buffer) {
        messages.push(partial.event);
        *buffer = partial.remainder;
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MULTILINE: &str =
        "<event>\n    <detail remarks=\"\nI am a multiline\nremarks field\n    \"/>\n</event>";

    #[test]
    fn test_unfinished_event() {
        assert_eq!(find_cot("<event ><detail>"), None);
    }

    #[test]
    fn test_basic_event() {
        let res = find_cot("<event></event>").unwrap();
        assert_eq!(res.event, "<event></event>");
        assert_eq!(res.remainder, "");
    }

    #[test]
    fn test_multiline_event() {
        let res = find_cot(&format!("\n{}", MULTILINE)).unwrap();
        assert_eq!(res.event, MULTILINE);
        assert_eq!(res.remainder, "");
    }

    #[test]
    fn test_multiline_non_greedy() {
        let res = find_cot(&format!("\n{}{}", MULTILINE, MULTILINE)).unwrap();
        assert_eq!(res.event, MULTILINE);
        assert_eq!(res.remainder, MULTILINE);
    }

    #[test]
    fn test_leading_garbage() {
        let res = find_cot("\n<fake/>\n<event><detail remarks=\"I am remarks\"/>\n</event>\n").unwrap();
        assert_eq!(res.event, "<event><detail remarks=\"I am remarks\"/>\n</event>");
        assert_eq!(res.remainder, "\n");
    }

    #[test]
    fn test_trailing_garbage() {
        let res = find_cot("\n<event><detail remarks=\"I am remarks\"/>\n</event>\n<fake/>\n").unwrap();
        assert_eq!(res.event, "<event><detail remarks=\"I am remarks\"/>\n</event>");
        assert_eq!(res.remainder, "\n<fake/>\n");
    }

    #[test]
    fn test_mixed_data() {
        let res = find_cot(
            "\n<event><detail remarks=\"I am remarks\"/>\n</event>\n<fake/>\n<event><detail remarks=\"I am remarks\"/></event>",
        )
        .unwrap();
        assert_eq!(res.event, "<event><detail remarks=\"I am remarks\"/>\n</event>");
        assert_eq!(
            res.remainder,
            "\n<fake/>\n<event><detail remarks=\"I am remarks\"/></event>"
        );
    }

    #[test]
    fn test_events_tag_does_not_match() {
        assert_eq!(find_cot("<events></events>"), None);
    }

    #[test]
    fn test_control_characters_are_stripped() {
        let res = find_cot("\u{0}\u{1b}<event>\u{7f}a\u{85}\tb\u{0b}</event>\u{9f}").unwrap();
        assert_eq!(res.event, "<event>a\tb</event>");
        assert_eq!(res.remainder, "");
    }

    #[test]
    fn test_drain_leaves_partial_tail() {
        let mut buffer = "<event>1</event><event>2</event><event>3".to_string();
        let messages = drain_messages(&mut buffer);
        assert_eq!(messages, vec!["<event>1</event>", "<event>2</event>"]);
        assert_eq!(buffer, "<event>3");
    }

    fn message() -> impl Strategy<Value = String> {
        "[a-z0-9 =\"/]{0,24}".prop_map(|body| format!("<event uid=\"x\">{}</event>", body))
    }

    /// Text that never forms `<event`, alone or next to a message.
    fn noise() -> impl Strategy<Value = String> {
        let piece = prop_oneof![
            "[a-z0-9 =/>\n]{1,8}",
            Just("<fake/>".to_string()),
            Just("<events/>".to_string()),
            Just("</event>".to_string()),
        ];
        prop::collection::vec(piece, 0..4).prop_map(|pieces| pieces.concat())
    }

    fn control_char() -> impl Strategy<Value = char> {
        prop_oneof![0x00u32..=0x08, 0x0Bu32..=0x1F, 0x7Fu32..=0x9F]
            .prop_map(|c| char::from_u32(c).unwrap())
    }

    /// `noise, message, noise, message, ..., tail`
    fn interleave(messages: &[String], gaps: &[String], tail: &str) -> String {
        let mut stream = String::new();
        for (i, message) in messages.iter().enumerate() {
            stream.push_str(&gaps[i % gaps.len()]);
            stream.push_str(message);
        }
        stream.push_str(tail);
        stream
    }

    /// Feeds `stream` in chunks split at `cuts` and collects what comes out.
    fn feed(stream: &str, cuts: &[prop::sample::Index]) -> (Vec<String>, String) {
        let mut offsets: Vec<usize> = cuts
            .iter()
            .map(|i| {
                let mut at = i.index(stream.len() + 1);
                while !stream.is_char_boundary(at) {
                    at -= 1;
                }
                at
            })
            .collect();
        offsets.push(0);
        offsets.push(stream.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut buffer = String::new();
        let mut extracted = Vec::new();
        for window in offsets.windows(2) {
            buffer.push_str(&stream[window[0]..window[1]]);
            extracted.extend(drain_messages(&mut buffer));
        }
        (extracted, buffer)
    }

    proptest! {
        #[test]
        fn prop_framing_is_independent_of_chunking(
            messages in prop::collection::vec(message(), 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let stream: String = messages.concat();
            let (extracted, buffer) = feed(&stream, &cuts);

            prop_assert_eq!(extracted, messages);
            prop_assert_eq!(buffer, "");
        }

        #[test]
        fn prop_noise_between_messages_is_dropped(
            messages in prop::collection::vec(message(), 1..6),
            gaps in prop::collection::vec(noise(), 1..6),
            tail in noise(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let stream = interleave(&messages, &gaps, &tail);
            let (extracted, buffer) = feed(&stream, &cuts);

            prop_assert_eq!(extracted, messages);
            prop_assert_eq!(buffer, tail);
        }

        #[test]
        fn prop_control_characters_never_reach_messages(
            messages in prop::collection::vec(message(), 1..6),
            gaps in prop::collection::vec(noise(), 1..4),
            tail in noise(),
            dirt in prop::collection::vec((any::<prop::sample::Index>(), control_char()), 1..16),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut chars: Vec<char> = interleave(&messages, &gaps, &tail).chars().collect();
            for (at, c) in &dirt {
                let at = at.index(chars.len() + 1);
                chars.insert(at, *c);
            }
            let stream: String = chars.into_iter().collect();
            let (extracted, buffer) = feed(&stream, &cuts);

            prop_assert_eq!(extracted, messages);
            prop_assert_eq!(CONTROL_CHARS.replace_all(&buffer, "").into_owned(), tail);
        }
    }
}
