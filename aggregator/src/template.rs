//! `${VAR}` substitution for the YAML config.
//!
//! Lets a static config file reference values injected at deploy time, most commonly the
//! downstream base address: `services_host: "${SERVICES_HOST:-http://localhost:8080}"`.

/// Render `input` using the process environment.
pub fn render_env_template(input: &str) -> anyhow::Result<String> {
    render_env_template_with(input, |name| std::env::var(name).ok())
}

/// Render a template by replacing placeholders with values provided by `lookup`.
///
/// Supported placeholder syntax:
/// - `${NAME}`: the variable must be set; an empty value is kept.
/// - `${NAME:-fallback}`: `fallback` is used when the variable is unset or empty.
///
/// `NAME` must match `[A-Za-z_][A-Za-z0-9_]*`.
pub fn render_env_template_with(
    input: &str,
    mut lookup: impl FnMut(&str) -> Option<String>,
) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            anyhow::bail!("unterminated placeholder");
        };
        let body = &after[..close];

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        validate_env_name(name)?;

        let value = match (lookup(name), fallback) {
            (Some(value), Some(fallback)) if value.is_empty() => fallback.to_string(),
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => anyhow::bail!("missing environment variable: {name}"),
        };
        out.push_str(&value);
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn validate_env_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        anyhow::bail!("empty placeholder name");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        anyhow::bail!("invalid placeholder name: {name}");
    }
    if chars.any(|ch| !(ch.is_ascii_alphanumeric() || ch == '_')) {
        anyhow::bail!("invalid placeholder name: {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn render(input: &str, env: &[(&str, &str)]) -> anyhow::Result<String> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        render_env_template_with(input, |k| env.get(k).cloned())
    }

    #[test]
    fn replaces_placeholders() {
        assert_eq!(
            render("host: ${HOST}:${PORT}", &[("HOST", "svc"), ("PORT", "80")]).unwrap(),
            "host: svc:80"
        );
    }

    #[test]
    fn fallback_used_when_unset_or_empty() {
        let tpl = "${SERVICES_HOST:-http://localhost:8080}";
        assert_eq!(render(tpl, &[]).unwrap(), "http://localhost:8080");
        assert_eq!(
            render(tpl, &[("SERVICES_HOST", "")]).unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(
            render(tpl, &[("SERVICES_HOST", "http://backend:9000")]).unwrap(),
            "http://backend:9000"
        );
    }

    #[test]
    fn empty_value_is_kept_without_fallback() {
        assert_eq!(
            render("prefix: \"${PREFIX}\"", &[("PREFIX", "")]).unwrap(),
            "prefix: \"\""
        );
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        assert_eq!(render("prix: 10€ $5", &[]).unwrap(), "prix: 10€ $5");
    }

    #[test]
    fn missing_placeholder_is_an_error() {
        assert!(render("${MISSING}", &[]).is_err());
    }

    #[test]
    fn invalid_placeholder_name_is_an_error() {
        assert!(render("${123}", &[("X", "ok")]).is_err());
        assert!(render("${X-Y}", &[("X", "ok")]).is_err());
        assert!(render("${:-x}", &[]).is_err());
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(render("${X", &[]).is_err());
    }
}
