//! Arithmetic challenge embedded in every probe.
//!
//! A gateway that answers 200 with canned text will not contain the answer to
//! a freshly generated sum, so a passing check proves real inference ran.

use rand::Rng;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d{1,3}(?:,\d{3})+|-?\d+").expect("number pattern compiles"));

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Add => "+",
            Operator::Subtract => "-",
            Operator::Multiply => "*",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub left: i64,
    pub operator: Operator,
    pub right: i64,
    pub prompt: String,
    pub expected: i64,
}

/// Result of checking a reply against a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub expected: i64,
    pub extracted: Vec<i64>,
}

impl Verdict {
    pub fn describe_mismatch(&self) -> String {
        let extracted =
            self.extracted.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
        format!("answer mismatch: expected={}, extracted=[{}]", self.expected, extracted)
    }
}

impl Challenge {
    pub fn new(left: i64, operator: Operator, right: i64) -> Self {
        let expected = match operator {
            Operator::Add => left + right,
            Operator::Subtract => left - right,
            Operator::Multiply => left * right,
        };
        let prompt = format!(
            "What is {}? Reply with only the resulting number and nothing else.",
            expression(left, operator, right)
        );
        Self { left, operator, right, prompt, expected }
    }

    /// An answer equal to an operand could be "found" in an echo of the prompt.
    fn answer_is_operand(&self) -> bool {
        self.expected == self.left || self.expected == self.right
    }

    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    /// Small operands only; subtraction never goes negative and no answer
    /// repeats an operand.
    pub fn random_with<R: Rng>(rng: &mut R) -> Self {
        loop {
            let challenge = Self::draw(rng);
            if !challenge.answer_is_operand() {
                return challenge;
            }
        }
    }

    fn draw<R: Rng>(rng: &mut R) -> Self {
        match rng.gen_range(0..3) {
            0 => Self::new(rng.gen_range(1..=50), Operator::Add, rng.gen_range(1..=50)),
            1 => {
                let a = rng.gen_range(1..=50);
                let b = rng.gen_range(1..=50);
                Self::new(a.max(b), Operator::Subtract, a.min(b))
            }
            _ => Self::new(rng.gen_range(2..=12), Operator::Multiply, rng.gen_range(2..=12)),
        }
    }

    /// Passes when the reply contains the expected number outside any echo of
    /// the prompt or the bare expression.
    pub fn verify(&self, reply: &str) -> Verdict {
        let answer = reply
            .replace(&self.prompt, " ")
            .replace(&expression(self.left, self.operator, self.right), " ");
        let extracted = extract_numbers(&answer);
        Verdict { passed: extracted.contains(&self.expected), expected: self.expected, extracted }
    }
}

fn expression(left: i64, operator: Operator, right: i64) -> String {
    format!("{left} {operator} {right}")
}

/// All integers in `text`, ignoring `<think>` sections and thousands separators.
pub fn extract_numbers(text: &str) -> Vec<i64> {
    let visible = THINK_BLOCK.replace_all(text, " ");
    NUMBER
        .find_iter(&visible)
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_expected_answers() {
        assert_eq!(Challenge::new(17, Operator::Add, 25).expected, 42);
        assert_eq!(Challenge::new(50, Operator::Subtract, 8).expected, 42);
        assert_eq!(Challenge::new(6, Operator::Multiply, 7).expected, 42);
    }

    #[test]
    fn test_prompt_embeds_operands() {
        let challenge = Challenge::new(17, Operator::Add, 25);
        assert!(challenge.prompt.contains("17 + 25"));
    }

    #[test]
    fn test_verify_accepts_answer_anywhere() {
        let challenge = Challenge::new(17, Operator::Add, 25);
        assert!(challenge.verify("42").passed);
        assert!(challenge.verify("The answer is 42.").passed);
        assert!(challenge.verify("17 + 25 = 42").passed);
    }

    #[test]
    fn test_echoed_prompt_never_passes() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2_000 {
            let challenge = Challenge::random_with(&mut rng);
            assert!(!challenge.verify(&challenge.prompt).passed, "{}", challenge.prompt);
            assert_ne!(challenge.expected, challenge.left);
            assert_ne!(challenge.expected, challenge.right);
        }
    }

    #[test]
    fn test_echo_of_operand_answer_is_ignored() {
        // Built directly: random generation never yields this shape.
        let challenge = Challenge::new(50, Operator::Subtract, 25);
        assert!(!challenge.verify(&challenge.prompt).passed);
        assert!(!challenge.verify("50 - 25").passed);
        assert!(challenge.verify("50 - 25 = 25").passed);
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let challenge = Challenge::new(17, Operator::Add, 25);
        let verdict = challenge.verify("41");
        assert!(!verdict.passed);
        assert_eq!(verdict.extracted, vec![41]);
        assert_eq!(verdict.describe_mismatch(), "answer mismatch: expected=42, extracted=[41]");
    }

    #[test]
    fn test_verify_without_numbers() {
        let verdict = Challenge::new(2, Operator::Multiply, 3).verify("I cannot help with that");
        assert!(!verdict.passed);
        assert!(verdict.extracted.is_empty());
    }

    #[test]
    fn test_think_blocks_are_ignored() {
        let challenge = Challenge::new(20, Operator::Add, 22);
        assert!(!challenge.verify("<think>maybe 42?</think> 41").passed);
        assert!(challenge.verify("<think>20 plus 22</think>42").passed);
    }

    #[test]
    fn test_thousands_separator() {
        assert_eq!(extract_numbers("1,234 and 56"), vec![1234, 56]);
    }

    #[test]
    fn test_random_challenges_stay_small_and_non_negative() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let challenge = Challenge::random_with(&mut rng);
            assert!(challenge.expected >= 0);
            assert!(challenge.expected <= 144);
            assert!(challenge.verify(&challenge.expected.to_string()).passed);
        }
    }
}
