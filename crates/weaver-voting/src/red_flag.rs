use regex::Regex;
use serde::{Deserialize, Serialize};

/// One acceptance rule a candidate output must satisfy (spec.md §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedFlagRule {
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub required_regex: Option<String>,
    #[serde(default)]
    pub require_json: bool,
}

const DEFAULT_MAX_CHARS: usize = 4000;

/// Heuristic filter over sampled outputs; returns the list of violated reason codes
/// (empty = accept). Mirrors the `hooks.rs` Continue/Cancel idiom from the teacher
/// workspace, expressed here as a pure function instead of a hook chain, since rule
/// evaluation has no side effects (spec.md §4.4: "pure and side-effect free").
pub fn evaluate(output: &str, rules: &[RedFlagRule]) -> Vec<String> {
    let mut violations = Vec::new();
    let max_chars_set = rules.iter().any(|r| r.max_chars.is_some());
    let effective_max_chars = if max_chars_set {
        rules.iter().find_map(|r| r.max_chars)
    } else {
        Some(DEFAULT_MAX_CHARS)
    };

    if let Some(limit) = effective_max_chars {
        if output.chars().count() > limit {
            violations.push("max-chars".to_string());
        }
    }
    for rule in rules {
        if let Some(limit) = rule.max_tokens {
            if output.split_whitespace().count() > limit {
                violations.push("max-tokens".to_string());
            }
        }
        if let Some(pattern) = &rule.required_regex {
            match Regex::new(pattern) {
                Ok(re) if !re.is_match(output) => violations.push("required-regex".to_string()),
                Err(_) => violations.push("invalid-regex".to_string()),
                _ => {}
            }
        }
        if rule.require_json && serde_json::from_str::<serde_json::Value>(output).is_err() {
            violations.push("require-json".to_string());
        }
    }

    if looks_like_shell_instructions(output) {
        violations.push("shell-instructions".to_string());
    }
    if looks_like_ordered_instructions(output) {
        violations.push("ordered-instructions".to_string());
    }

    violations.sort();
    violations.dedup();
    violations
}

const SHELL_LEADING_TOKENS: &[&str] =
    &["mkdir", "touch", "cd", "ls", "git", "rm", "npm", "npx", "cargo", "pip", "yarn"];

fn looks_like_shell_instructions(output: &str) -> bool {
    let first_line = output.lines().next().unwrap_or("").trim();
    let first_token = first_line.split_whitespace().next().unwrap_or("");
    SHELL_LEADING_TOKENS.contains(&first_token)
}

fn looks_like_ordered_instructions(output: &str) -> bool {
    let re = Regex::new(r"(?i)^\s*\d+\.\s*(create|add|open|install|run|start|build|make|write)\b").unwrap();
    output.lines().any(|line| re.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_chars_applies_when_no_rule_sets_it() {
        let output = "x".repeat(4001);
        let violations = evaluate(&output, &[]);
        assert_eq!(violations, vec!["max-chars".to_string()]);
    }

    #[test]
    fn caller_max_chars_overrides_default() {
        let rule = RedFlagRule { max_chars: Some(10), ..Default::default() };
        let violations = evaluate(&"x".repeat(4001), std::slice::from_ref(&rule));
        assert_eq!(violations, vec!["max-chars".to_string()]);
        assert!(evaluate("short", &[rule]).is_empty());
    }

    #[test]
    fn rejects_shell_instruction_leading_token() {
        let violations = evaluate("mkdir src && touch src/main.rs", &[]);
        assert!(violations.contains(&"shell-instructions".to_string()));
    }

    #[test]
    fn rejects_ordered_instruction_lists() {
        let output = "1. Create a new file\n2. Add the import";
        let violations = evaluate(output, &[]);
        assert!(violations.contains(&"ordered-instructions".to_string()));
    }

    #[test]
    fn accepts_plain_file_content() {
        let violations = evaluate("fn main() {\n    println!(\"hi\");\n}", &[]);
        assert!(violations.is_empty());
    }

    #[test]
    fn required_regex_must_match() {
        let rule = RedFlagRule { required_regex: Some("fn main".to_string()), ..Default::default() };
        assert!(!evaluate("fn main() {}", &[rule.clone()]).contains(&"required-regex".to_string()));
        assert!(evaluate("no entrypoint here", &[rule]).contains(&"required-regex".to_string()));
    }
}
