// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use super::error::ConfigError;

/// Resolves `${VAR}` and `${VAR:-fallback}` references from the environment.
///
/// A bare `${VAR}` that is not set is an error; the `:-` form substitutes
/// the fallback instead. Unterminated references are kept literally.
pub fn resolve_variables(input: &str) -> Result<String, ConfigError> {
    resolve_with(input, |name| std::env::var(name).ok())
}

pub(crate) fn resolve_with(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: keep the remainder verbatim
            result.push_str(&rest[start..]);
            return Ok(result);
        };

        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };

        if name.is_empty() {
            result.push_str("${");
            result.push_str(reference);
            result.push('}');
        } else {
            match (lookup(name), fallback) {
                (Some(value), _) => result.push_str(&value),
                (None, Some(fallback)) => result.push_str(fallback),
                (None, None) => {
                    return Err(ConfigError::UndefinedVariable {
                        name: name.to_string(),
                    })
                }
            }
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "RELAY_UPSTREAM_URL" => Some("http://127.0.0.1:7000/generate".to_string()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_set_variable() {
        let out = resolve_with("url: ${RELAY_UPSTREAM_URL}", lookup).unwrap();
        assert_eq!(out, "url: http://127.0.0.1:7000/generate");
    }

    #[test]
    fn fallback_used_when_unset() {
        let out = resolve_with("${MISSING:-dev}", lookup).unwrap();
        assert_eq!(out, "dev");
    }

    #[test]
    fn unset_without_fallback_is_error() {
        let err = resolve_with("${MISSING}", lookup).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedVariable { ref name } if name == "MISSING"));
    }

    #[test]
    fn unterminated_reference_kept_literally() {
        let out = resolve_with("a ${OPEN", lookup).unwrap();
        assert_eq!(out, "a ${OPEN");
    }

    #[test]
    fn text_without_references_unchanged() {
        let out = resolve_with("plain: value", lookup).unwrap();
        assert_eq!(out, "plain: value");
    }
}
