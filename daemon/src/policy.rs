//! Static checks run against a job script before anything is spawned.

use crate::config::SandboxConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("script is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("script is not valid UTF-8")]
    NotUtf8,
    #[error("line {line}: command '{command}' is blocked")]
    BlockedCommand { line: usize, command: String },
    #[error("line {line}: command '{command}' is not in the allowed list")]
    NotAllowed { line: usize, command: String },
    #[error("line {line}: contains blocked pattern '{pattern}'")]
    BlockedPattern { line: usize, pattern: String },
}

#[derive(Debug, Clone)]
pub struct ScriptPolicy {
    max_bytes: usize,
    blocked_commands: Vec<String>,
    allowed_commands: Vec<String>,
    blocked_patterns: Vec<String>,
}

/// Characters that end a shell word for the purpose of finding command names.
const SEPARATORS: &[char] = &[';', '|', '&', '(', ')', '`', '{', '}', '<', '>', '"', '\''];

impl ScriptPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        let lower = |v: &[String]| -> Vec<String> { v.iter().map(|s| s.to_lowercase()).collect() };
        Self {
            max_bytes: config.max_script_bytes,
            blocked_commands: lower(&config.blocked_commands),
            allowed_commands: lower(&config.allowed_commands),
            blocked_patterns: lower(&config.blocked_patterns),
        }
    }

    pub fn check(&self, script: &[u8]) -> Result<(), PolicyViolation> {
        if script.len() > self.max_bytes {
            return Err(PolicyViolation::TooLarge {
                size: script.len(),
                limit: self.max_bytes,
            });
        }
        let text = std::str::from_utf8(script).map_err(|_| PolicyViolation::NotUtf8)?;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim().to_lowercase();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(pattern) = self.blocked_patterns.iter().find(|p| line.contains(p.as_str())) {
                return Err(PolicyViolation::BlockedPattern {
                    line: line_no,
                    pattern: pattern.clone(),
                });
            }

            let words = words(&line);
            if let Some(word) = words.iter().find(|w| self.blocked_commands.contains(&command_name(w))) {
                return Err(PolicyViolation::BlockedCommand {
                    line: line_no,
                    command: command_name(word),
                });
            }

            if !self.allowed_commands.is_empty() {
                if let Some(first) = words.first() {
                    let name = command_name(first);
                    if !self.allowed_commands.contains(&name) {
                        return Err(PolicyViolation::NotAllowed {
                            line: line_no,
                            command: name,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn words(line: &str) -> Vec<&str> {
    let code = match line.find(" #") {
        Some(idx) => &line[..idx],
        None => line,
    };
    code.split(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
        .map(|w| w.trim_start_matches("$("))
        .filter(|w| !w.is_empty())
        .collect()
}

/// `/usr/bin/rm` and `rm` name the same command.
fn command_name(word: &str) -> String {
    word.rsplit('/').next().unwrap_or(word).to_string()
}
