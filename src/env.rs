//! Environment templates and their resolution.
//!
//! Declared values may reference the supervisor's inherited environment with
//! `${VAR}` or `${VAR:-default}`. The `:-` form falls back to `default` when
//! the variable is unset *or* empty. `$$` produces a literal `$`. Everything
//! else, `~` included, is copied verbatim.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::process::AppEntry;

/// A parsed environment value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTemplate {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var {
        name: String,
        default: Option<String>,
    },
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("reference pattern is valid")
    })
}

impl EnvTemplate {
    /// Parses a declared value, rejecting malformed `${...}` references.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut cursor = 0;
        for caps in reference_pattern().captures_iter(raw) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            check_gap(&raw[cursor..whole.start()])?;
            literal.push_str(&raw[cursor..whole.start()]);
            cursor = whole.end();

            if whole.as_str() == "$$" {
                literal.push('$');
                continue;
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Var {
                name: caps[1].to_string(),
                default: caps.get(2).map(|m| m.as_str().to_string()),
            });
        }
        check_gap(&raw[cursor..])?;
        literal.push_str(&raw[cursor..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The value as written in the config file.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Expands the template against `inherited`.
    pub fn render(&self, inherited: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var { name, default } => {
                    let value = inherited.get(name).map(String::as_str);
                    match (value, default) {
                        (Some(value), _) if !value.is_empty() => out.push_str(value),
                        (_, Some(default)) => out.push_str(default),
                        (Some(value), None) => out.push_str(value),
                        (None, None) => {}
                    }
                }
            }
        }
        out
    }
}

// Text between recognised references must not open another one.
fn check_gap(gap: &str) -> Result<(), String> {
    if let Some(pos) = gap.find("${") {
        return Err(format!("malformed reference `{}`", &gap[pos..]));
    }
    Ok(())
}

/// Resolves every declared variable of `entry` against `inherited`.
///
/// Pure: the inherited environment is passed in rather than read from the
/// process, so the same inputs always produce the same map.
pub fn resolve_env(
    entry: &AppEntry,
    inherited: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    entry
        .env
        .iter()
        .map(|(key, template)| (key.clone(), template.render(inherited)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inherited(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn fallback_uses_inherited_value_when_set() {
        let template = EnvTemplate::parse("${HF_HOME:-~/.cache/huggingface}").unwrap();
        let env = inherited(&[("HF_HOME", "/data/hf")]);
        assert_eq!(template.render(&env), "/data/hf");
    }

    #[test]
    fn fallback_uses_default_when_absent_or_empty() {
        let template = EnvTemplate::parse("${HF_HOME:-~/.cache/huggingface}").unwrap();
        assert_eq!(template.render(&HashMap::new()), "~/.cache/huggingface");
        let empty = inherited(&[("HF_HOME", "")]);
        assert_eq!(template.render(&empty), "~/.cache/huggingface");
    }

    #[test]
    fn plain_reference_expands_to_value_or_nothing() {
        let template = EnvTemplate::parse("${HOME}/models").unwrap();
        assert_eq!(template.render(&inherited(&[("HOME", "/root")])), "/root/models");
        assert_eq!(template.render(&HashMap::new()), "/models");
    }

    #[test]
    fn literals_are_copied_verbatim() {
        let template = EnvTemplate::parse("1").unwrap();
        assert_eq!(template.render(&inherited(&[("1", "x")])), "1");
        let tilde = EnvTemplate::parse("~/cache $PATH").unwrap();
        assert_eq!(tilde.render(&HashMap::new()), "~/cache $PATH");
    }

    #[test]
    fn double_dollar_escapes() {
        let template = EnvTemplate::parse("$${HOME}").unwrap();
        assert_eq!(template.render(&inherited(&[("HOME", "/root")])), "${HOME}");
    }

    #[test]
    fn rejects_unterminated_reference() {
        assert!(EnvTemplate::parse("${HF_HOME:-oops").is_err());
        assert!(EnvTemplate::parse("prefix ${1BAD}").is_err());
    }

    #[test]
    fn resolve_env_is_deterministic() {
        let mut entry = AppEntry::new("gen", "python");
        entry.env.insert(
            "TORCH_HOME".to_string(),
            EnvTemplate::parse("${TORCH_HOME:-~/.cache/torch}").unwrap(),
        );
        entry
            .env
            .insert("PYTHONUNBUFFERED".to_string(), EnvTemplate::parse("1").unwrap());
        let env = inherited(&[("TORCH_HOME", "/mnt/torch")]);
        let first = resolve_env(&entry, &env);
        assert_eq!(first, resolve_env(&entry, &env));
        assert_eq!(first["TORCH_HOME"], "/mnt/torch");
        assert_eq!(first["PYTHONUNBUFFERED"], "1");
    }
}
