use crate::GmemError;
use regex::{Regex, RegexSet};
use std::borrow::Cow;

const PLACEHOLDER: &str = "[REDACTED]";

const BUILTIN_PATTERNS: &[&str] = &[
    r"AKIA[0-9A-Z]{16}",
    r"(?i)aws[_\-]?secret[_\-]?access[_\-]?key\s*[=:]\s*\S+",
    r"github_pat_[A-Za-z0-9_]{82}",
    r"gh[posu]_[A-Za-z0-9]{36}",
    r"sk-ant-[A-Za-z0-9\-_]{20,}",
    r"sk-[A-Za-z0-9\-_]{20,}",
    r"xox[baprs]-[A-Za-z0-9\-]{10,}",
    r"(?i)bearer\s+[A-Za-z0-9_\-.~+/]{20,}=*",
    r"-----BEGIN\s+(RSA|EC|DSA|OPENSSH|PGP)?\s*PRIVATE\s+KEY-----",
    r"(postgres|postgresql|mysql|mongodb(\+srv)?|redis|amqp|https?)://[^:/\s]+:[^@\s]+@",
    r"(?i)(password|passwd|secret|token|api_key|apikey)\s*[=:]\s*\S+",
];

/// Scrubs credentials from transcript text before it leaves the machine.
pub struct SecretRedactor {
    set: RegexSet,
    patterns: Vec<Regex>,
}

impl SecretRedactor {
    pub fn new(extra_patterns: &[String]) -> Result<Self, GmemError> {
        let all: Vec<&str> = BUILTIN_PATTERNS
            .iter()
            .copied()
            .chain(extra_patterns.iter().map(String::as_str))
            .collect();
        let set = RegexSet::new(&all).map_err(|e| GmemError::Config(format!("redaction: {e}")))?;
        let patterns = all
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GmemError::Config(format!("redaction: {e}")))?;
        Ok(Self { set, patterns })
    }

    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let hits = self.set.matches(input);
        if !hits.matched_any() {
            return Cow::Borrowed(input);
        }
        let mut out = input.to_string();
        for idx in hits.into_iter() {
            if let Cow::Owned(replaced) = self.patterns[idx].replace_all(&out, PLACEHOLDER) {
                out = replaced;
            }
        }
        Cow::Owned(out)
    }
}
