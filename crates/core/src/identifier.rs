//! Identifier Normalization
//!
//! Speech-to-text renders the same member, order or prescription id in many
//! ways: "M1001", "m 1 0 0 1", "M-one-zero-zero-one". Every lookup goes through
//! [`normalize`] so the data store only ever compares canonical ids.

/// Spelled-out digits, in the order they are substituted.
const DIGIT_WORDS: [(&str, char); 10] = [
    ("ZERO", '0'),
    ("ONE", '1'),
    ("TWO", '2'),
    ("THREE", '3'),
    ("FOUR", '4'),
    ("FIVE", '5'),
    ("SIX", '6'),
    ("SEVEN", '7'),
    ("EIGHT", '8'),
    ("NINE", '9'),
];

/// Canonicalizes a raw identifier: uppercase ASCII alphanumerics only, with
/// spelled-out digits replaced by their numerals.
///
/// Digit words are substituted while separators are still present, then every
/// non-alphanumeric character is stripped. A second substitution pass catches
/// words that only became contiguous once separators were removed
/// ("O-N-E"), which makes the function idempotent.
pub fn normalize(raw: &str) -> String {
    let spelled = replace_digit_words(&raw.to_uppercase());
    let stripped: String = spelled
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    replace_digit_words(&stripped)
}

fn replace_digit_words(input: &str) -> String {
    DIGIT_WORDS
        .iter()
        .fold(input.to_string(), |acc, (word, digit)| {
            acc.replace(word, digit.encode_utf8(&mut [0; 4]))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spoken_variants_collapse_to_one_id() {
        assert_eq!(normalize("M 1 0 0 1"), "M1001");
        assert_eq!(normalize("m1001"), "M1001");
        assert_eq!(normalize("M-1-0-0-1"), "M1001");
        assert_eq!(normalize("M one zero zero one"), "M1001");
        assert_eq!(normalize("m_one_zero_zero_one"), "M1001");
    }

    #[test]
    fn test_digit_words_touching_punctuation() {
        assert_eq!(normalize("ORD zero-zero-one."), "ORD001");
        assert_eq!(normalize("R X, one, zero, zero, one!"), "RX1001");
    }

    #[test]
    fn test_separated_letters_forming_a_digit_word() {
        assert_eq!(normalize("O-N-E"), "1");
        assert_eq!(normalize("n i n e"), "9");
    }

    #[test]
    fn test_empty_and_separator_only_input() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" - _ "), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "M 1 0 0 1",
            "m1001",
            "M-1-0-0-1",
            "ORD zero zero one",
            "O N E",
            "t-w-o f-o-u-r",
            "seveneight",
            "NONE",
            "Rx 10-01.",
            "ÄM 1",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn test_output_is_uppercase_alphanumeric() {
        let id = normalize("ord-00 one / rx.two");
        assert!(
            id.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }
}
