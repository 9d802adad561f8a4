//! Trigger-line classification.
//!
//! A trigger fires when any line of the message, taken on its own, is exactly
//! the command phrase (case-insensitive, trailing punctuation allowed).  Lines
//! inside fenced code blocks and block-quoted lines never count, so quoting or
//! pasting a transcript cannot flip a session's mode.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    HeySani,
    WhoAmI,
    ExitSaniMode,
}

impl Trigger {
    pub const ALL: [Trigger; 3] = [Self::HeySani, Self::WhoAmI, Self::ExitSaniMode];

    /// Event name recorded as `source_trigger` on memory written because of this trigger.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::HeySani => "HEY_SANI",
            Self::WhoAmI => "WHO_AM_I",
            Self::ExitSaniMode => "EXIT_SANI_MODE",
        }
    }

    fn matcher(self) -> &'static Regex {
        match self {
            Self::HeySani => &HEY_SANI,
            Self::WhoAmI => &WHO_AM_I,
            Self::ExitSaniMode => &EXIT_SANI_MODE,
        }
    }
}

const TRAILING_PUNCT: &str = r"[\s.!?,;:…]*$";

fn phrase(words: &str) -> Regex {
    let pattern = format!(r"(?i)^{words}{TRAILING_PUNCT}");
    Regex::new(&pattern).expect("trigger phrase regex is valid")
}

static HEY_SANI: LazyLock<Regex> = LazyLock::new(|| phrase(r"hey\s+sani"));
static WHO_AM_I: LazyLock<Regex> = LazyLock::new(|| phrase(r"who\s+am\s+i"));
static EXIT_SANI_MODE: LazyLock<Regex> = LazyLock::new(|| phrase(r"exit\s+sani\s+mode"));

/// Fence character and run length when `line` opens or closes a code fence.
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let ch = line.chars().next().filter(|c| matches!(c, '`' | '~'))?;
    let run = line.chars().take_while(|&c| c == ch).count();
    (run >= 3).then_some((ch, run))
}

/// Lines eligible for trigger matching: outside fences and not block-quoted.
///
/// A fence only closes on a bare run of its own character at least as long as
/// the opener, so a `~~~` line inside a backtick block stays inside it.
fn candidate_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut open_fence: Option<(char, usize)> = None;
    text.lines().filter_map(move |line| {
        let trimmed = line.trim();
        if let Some((ch, len)) = open_fence {
            if let Some((close_ch, close_len)) = fence_marker(trimmed) {
                let bare = trimmed.trim_start_matches(close_ch).trim().is_empty();
                if close_ch == ch && close_len >= len && bare {
                    open_fence = None;
                }
            }
            return None;
        }
        if let Some(marker) = fence_marker(trimmed) {
            open_fence = Some(marker);
            return None;
        }
        if trimmed.starts_with('>') || trimmed.is_empty() {
            return None;
        }
        Some(trimmed)
    })
}

/// `true` if any eligible line of `text` is the standalone phrase for `trigger`.
pub fn matches_trigger(text: &str, trigger: Trigger) -> bool {
    let matcher = trigger.matcher();
    candidate_lines(text).any(|line| matcher.is_match(line))
}

/// Which triggers a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSet {
    pub hey_sani: bool,
    pub who_am_i: bool,
    pub exit_sani_mode: bool,
}

impl TriggerSet {
    pub fn is_empty(&self) -> bool {
        !(self.hey_sani || self.who_am_i || self.exit_sani_mode)
    }

    pub fn contains(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::HeySani => self.hey_sani,
            Trigger::WhoAmI => self.who_am_i,
            Trigger::ExitSaniMode => self.exit_sani_mode,
        }
    }
}

pub fn detect_triggers(text: &str) -> TriggerSet {
    let mut set = TriggerSet::default();
    for line in candidate_lines(text) {
        set.hey_sani |= HEY_SANI.is_match(line);
        set.who_am_i |= WHO_AM_I.is_match(line);
        set.exit_sani_mode |= EXIT_SANI_MODE.is_match(line);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_line_fires() {
        assert!(matches_trigger("hey sani", Trigger::HeySani));
        assert!(matches_trigger("Hey SANI!", Trigger::HeySani));
        assert!(matches_trigger("  hey   sani...  ", Trigger::HeySani));
        assert!(matches_trigger("good morning\nhey sani\nhow are you", Trigger::HeySani));
        assert!(matches_trigger("Who am I?", Trigger::WhoAmI));
        assert!(matches_trigger("EXIT SANI MODE.", Trigger::ExitSaniMode));
    }

    #[test]
    fn phrase_inside_a_sentence_does_not_fire() {
        assert!(!matches_trigger("I said hey sani yesterday", Trigger::HeySani));
        assert!(!matches_trigger("hey sani, what's up", Trigger::HeySani));
        assert!(!matches_trigger("who am i kidding", Trigger::WhoAmI));
        assert!(!matches_trigger("heysani", Trigger::HeySani));
    }

    #[test]
    fn quoted_lines_are_ignored() {
        assert!(!matches_trigger("> hey sani", Trigger::HeySani));
        assert!(!matches_trigger("  >> who am i", Trigger::WhoAmI));
        assert!(matches_trigger("> hey sani\nhey sani", Trigger::HeySani));
    }

    #[test]
    fn fenced_code_is_ignored() {
        let fenced = "look at this:\n```\nhey sani\n```\n";
        assert!(!matches_trigger(fenced, Trigger::HeySani));
        let tilde = "~~~text\nexit sani mode\n~~~";
        assert!(!matches_trigger(tilde, Trigger::ExitSaniMode));
        let after_fence = "```\ncode\n```\nwho am i";
        assert!(matches_trigger(after_fence, Trigger::WhoAmI));
        // An unterminated fence swallows the rest of the message.
        let open = "```rust\nhey sani";
        assert!(!matches_trigger(open, Trigger::HeySani));
    }

    #[test]
    fn fence_closes_only_on_its_own_delimiter() {
        let mixed = "```\n~~~\nhey sani\n```";
        assert!(!matches_trigger(mixed, Trigger::HeySani));
        let tilde_then_backticks = "~~~\n```\nwho am i\n~~~\nexit sani mode";
        assert!(!matches_trigger(tilde_then_backticks, Trigger::WhoAmI));
        assert!(matches_trigger(tilde_then_backticks, Trigger::ExitSaniMode));
        // A shorter run or a run carrying an info string does not close.
        let longer = "````\n```\nhey sani\n```rust\nhey sani\n````\nwho am i";
        assert!(!matches_trigger(longer, Trigger::HeySani));
        assert!(matches_trigger(longer, Trigger::WhoAmI));
    }

    #[test]
    fn detect_collects_every_trigger() {
        let set = detect_triggers("hey sani\nwho am i\n> exit sani mode");
        assert!(set.hey_sani);
        assert!(set.who_am_i);
        assert!(!set.exit_sani_mode);
        assert!(!set.is_empty());
        assert!(detect_triggers("nothing to see").is_empty());
        for trigger in Trigger::ALL {
            assert_eq!(
                detect_triggers("hey sani\nwho am i").contains(trigger),
                trigger != Trigger::ExitSaniMode
            );
        }
    }
}
