//! Include/exclude glob filters for recursive transfers.

use regex::Regex;

use crate::error::StorageResult;

#[derive(Debug, Clone)]
enum Rule {
    Include(Regex),
    Exclude(Regex),
}

/// Ordered include/exclude rules over relative paths.
///
/// Everything is included by default and the last matching rule wins.
/// `*` matches any run of characters, `/` included.
#[derive(Debug, Clone, Default)]
pub struct GlobFilter {
    rules: Vec<Rule>,
}

impl GlobFilter {
    /// Filter accepting every path.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter accepting only paths matching one of `patterns`.
    pub fn only<S: AsRef<str>>(patterns: &[S]) -> StorageResult<Self> {
        let mut filter = Self::default().exclude("*")?;
        for pattern in patterns {
            filter = filter.include(pattern.as_ref())?;
        }
        Ok(filter)
    }

    pub fn include(mut self, pattern: &str) -> StorageResult<Self> {
        self.rules.push(Rule::Include(glob_to_regex(pattern)?));
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> StorageResult<Self> {
        self.rules.push(Rule::Exclude(glob_to_regex(pattern)?));
        Ok(self)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.rules.iter().fold(true, |included, rule| match rule {
            Rule::Include(re) if re.is_match(path) => true,
            Rule::Exclude(re) if re.is_match(path) => false,
            _ => included,
        })
    }
}

fn glob_to_regex(pattern: &str) -> StorageResult<Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Ok(Regex::new(&re)?)
}
