//! Deterministic spoken-form rewriting for TTS input.
//!
//! Neural TTS voices read "$100.40" and "702-555-1234" literally unless
//! the text is rewritten the way a person would say it. Every rewrite is
//! deterministic; card numbers are expanded before phone numbers so a
//! bare 16-digit card is never mistaken for a phone number.

use regex::{Captures, Regex};

/// Compiled rewrite rules. Build once, reuse per synthesis call.
pub struct SpokenFormNormalizer {
    card: Regex,
    phone: Regex,
    cvv: Regex,
    currency: Regex,
    range: Regex,
    percent: Regex,
    time: Regex,
    at_sign: Regex,
    whitespace: Regex,
    abbreviations: Vec<(Regex, &'static str)>,
}

impl Default for SpokenFormNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpokenFormNormalizer {
    /// Compile the rule set.
    #[must_use]
    pub fn new() -> Self {
        let abbreviations = [
            (r"\bDr\.\s", "Doctor "),
            (r"\bMr\.\s", "Mister "),
            (r"\bMrs\.\s", "Missus "),
            (r"\bMs\.\s", "Miss "),
            (r"\bSt\.\s", "Street "),
            (r"\bAve\.\s", "Avenue "),
            (r"\bBlvd\.\s", "Boulevard "),
            (r"\betc\.", "et cetera"),
            (r"\be\.g\.", "for example"),
            (r"\bi\.e\.", "that is"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).expect("abbreviation"), replacement))
        .collect();

        Self {
            card: Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").expect("card"),
            phone: Regex::new(r"\+?1?[-.\s]?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b")
                .expect("phone"),
            cvv: Regex::new(r"(?i)\b(CVV|CVC|security code|code)[:\s]*(\d{3,4})\b").expect("cvv"),
            currency: Regex::new(r"\$([0-9,]+\.?[0-9]*)").expect("currency"),
            range: Regex::new(r"\b(\d+)-(\d+)\b").expect("range"),
            percent: Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percent"),
            time: Regex::new(r"\b(\d{1,2}):(\d{2})\s*(am|pm|AM|PM|a\.m\.|p\.m\.)?").expect("time"),
            at_sign: Regex::new(r"\s*@\s*").expect("at sign"),
            whitespace: Regex::new(r"\s+").expect("whitespace"),
            abbreviations,
        }
    }

    /// Rewrite `text` into its spoken form. Empty input stays empty.
    #[must_use]
    pub fn normalize(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        let mut result = text.to_owned();

        result = self
            .card
            .replace_all(&result, |caps: &Captures<'_>| card_to_words(&caps[0]))
            .into_owned();

        result = self
            .phone
            .replace_all(&result, |caps: &Captures<'_>| phone_to_words(&caps[0]))
            .into_owned();

        result = self
            .cvv
            .replace_all(&result, |caps: &Captures<'_>| {
                format!("{} {}", &caps[1], digits_to_words(&caps[2]))
            })
            .into_owned();

        result = self
            .currency
            .replace_all(&result, |caps: &Captures<'_>| currency_to_words(&caps[1]))
            .into_owned();

        result = self
            .range
            .replace_all(&result, |caps: &Captures<'_>| {
                match (caps[1].parse::<i64>(), caps[2].parse::<i64>()) {
                    (Ok(a), Ok(b)) => {
                        format!("{} to {}", number_to_words(a), number_to_words(b))
                    }
                    _ => caps[0].to_owned(),
                }
            })
            .into_owned();

        result = self
            .percent
            .replace_all(&result, |caps: &Captures<'_>| {
                let raw = caps[1].replace(',', "");
                if raw.contains('.') {
                    format!("{raw} percent")
                } else {
                    match raw.parse::<i64>() {
                        Ok(n) => format!("{} percent", number_to_words(n)),
                        Err(_) => caps[0].to_owned(),
                    }
                }
            })
            .into_owned();

        result = self
            .time
            .replace_all(&result, |caps: &Captures<'_>| time_to_words(caps))
            .into_owned();

        result = result.replace(" & ", " and ");
        result = result.replace('&', " and ");
        result = self.at_sign.replace_all(&result, " at ").into_owned();
        result = result.replace(" + ", " plus ");
        result = result.replace(" = ", " equals ");
        result = result.replace(" / ", " or ");
        result = result.replace("24/7", "twenty-four seven");

        for (pattern, replacement) in &self.abbreviations {
            result = pattern.replace_all(&result, *replacement).into_owned();
        }

        self.whitespace
            .replace_all(&result, " ")
            .trim()
            .to_owned()
    }
}

/// Spell a digit string one digit at a time.
fn digits_to_words(digits: &str) -> String {
    const WORDS: [&str; 10] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
    ];
    digits
        .chars()
        .filter(char::is_ascii_digit)
        .map(|c| WORDS[c as usize - '0' as usize])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Speak a phone number in its natural digit groups, with comma pauses.
fn phone_to_words(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();

    if digits.len() == 10 {
        format!(
            "{}, {}, {}",
            digits_to_words(&digits[..3]),
            digits_to_words(&digits[3..6]),
            digits_to_words(&digits[6..])
        )
    } else if digits.len() == 11 && digits.starts_with('1') {
        format!(
            "one, {}, {}, {}",
            digits_to_words(&digits[1..4]),
            digits_to_words(&digits[4..7]),
            digits_to_words(&digits[7..])
        )
    } else {
        digits_to_words(&digits)
    }
}

/// Speak a card number in groups of four.
fn card_to_words(card: &str) -> String {
    let digits: String = card.chars().filter(char::is_ascii_digit).collect();
    digits
        .as_bytes()
        .chunks(4)
        .map(|chunk| digits_to_words(std::str::from_utf8(chunk).unwrap_or("")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// "$X.YY" as dollars and cents.
fn currency_to_words(amount: &str) -> String {
    let amount = amount.replace(',', "");

    if let Some((dollar_part, cent_part)) = amount.split_once('.') {
        let dollars: i64 = dollar_part.parse().unwrap_or(0);
        let mut cents_text = cent_part.to_owned();
        while cents_text.len() < 2 {
            cents_text.push('0');
        }
        let cents: i64 = cents_text[..2].parse().unwrap_or(0);

        if cents == 0 {
            format!("{} dollars", number_to_words(dollars))
        } else if dollars == 0 {
            format!("{} cents", number_to_words(cents))
        } else {
            format!(
                "{} dollars and {} cents",
                number_to_words(dollars),
                number_to_words(cents)
            )
        }
    } else {
        match amount.parse::<i64>() {
            Ok(n) => format!("{} dollars", number_to_words(n)),
            Err(_) => format!("{amount} dollars"),
        }
    }
}

/// "2:30 pm" as spoken time; ":00" becomes o'clock.
fn time_to_words(caps: &Captures<'_>) -> String {
    let hour: i64 = caps[1].parse().unwrap_or(0);
    let minute_text = &caps[2];

    let mut spoken = if minute_text == "00" {
        format!("{} o'clock", number_to_words(hour))
    } else {
        let minute: i64 = minute_text.parse().unwrap_or(0);
        format!("{} {}", number_to_words(hour), number_to_words(minute))
    };

    if let Some(suffix) = caps.get(3) {
        let letters: Vec<char> = suffix
            .as_str()
            .chars()
            .filter(char::is_ascii_alphabetic)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if letters.len() == 2 {
            spoken.push_str(&format!(" {}.{}.", letters[0], letters[1]));
        }
    }
    spoken
}

/// Integer to English words, up to the millions.
#[must_use]
pub fn number_to_words(n: i64) -> String {
    const ONES: [&str; 20] = [
        "", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen",
        "eighteen", "nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];

    if n == 0 {
        return "zero".to_owned();
    }
    if n < 0 {
        return format!("negative {}", number_to_words(-n));
    }
    if n < 20 {
        return ONES[n as usize].to_owned();
    }
    if n < 100 {
        let tens = TENS[(n / 10) as usize];
        return if n % 10 == 0 {
            tens.to_owned()
        } else {
            format!("{tens} {}", ONES[(n % 10) as usize])
        };
    }
    if n < 1_000 {
        let hundreds = format!("{} hundred", ONES[(n / 100) as usize]);
        return if n % 100 == 0 {
            hundreds
        } else {
            format!("{hundreds} {}", number_to_words(n % 100))
        };
    }
    if n < 1_000_000 {
        let thousands = format!("{} thousand", number_to_words(n / 1_000));
        return if n % 1_000 == 0 {
            thousands
        } else {
            format!("{thousands} {}", number_to_words(n % 1_000))
        };
    }
    if n < 1_000_000_000 {
        let millions = format!("{} million", number_to_words(n / 1_000_000));
        return if n % 1_000_000 == 0 {
            millions
        } else {
            format!("{millions} {}", number_to_words(n % 1_000_000))
        };
    }
    n.to_string()
}
