use regex::Regex;

use maestro_core::config::InputConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::InputValidator;

const UNSAFE_PATTERNS: &[(&str, &str)] = &[
    (r"(?is)<script[^>]*>.*?</script>", "script tag"),
    (r"(?i)javascript:", "javascript: URL"),
    (r"(?i)\bon\w+\s*=", "inline event handler"),
];

/// Length and injection-pattern checks applied to every request.
pub struct DefaultValidator {
    max_length: usize,
    patterns: Vec<(Regex, &'static str)>,
    whitespace: Regex,
}

impl DefaultValidator {
    pub fn new(max_length: usize) -> Result<Self> {
        let patterns = UNSAFE_PATTERNS
            .iter()
            .map(|(pattern, name)| Ok((compile(pattern)?, *name)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            max_length,
            patterns,
            whitespace: compile(r"\s+")?,
        })
    }

    pub fn from_config(config: &InputConfig) -> Result<Self> {
        Self::new(config.max_input_length)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| MaestroError::Config(format!("invalid pattern {pattern}: {e}")))
}

impl InputValidator for DefaultValidator {
    fn validate(&self, input: &str) -> Result<()> {
        if input.trim().is_empty() {
            return Err(MaestroError::Validation("input is empty".into()));
        }
        let length = input.chars().count();
        if length > self.max_length {
            return Err(MaestroError::Validation(format!(
                "input is {} characters, limit is {}",
                length, self.max_length
            )));
        }
        for (pattern, name) in &self.patterns {
            if pattern.is_match(input) {
                return Err(MaestroError::Validation(format!("input contains a {}", name)));
            }
        }
        Ok(())
    }

    fn sanitize(&self, input: &str) -> String {
        let without_nul = input.replace('\0', "");
        self.whitespace
            .replace_all(without_nul.trim(), " ")
            .into_owned()
    }
}
