//! Small text helpers used by the command-line output.

use url::Url;

/// Formats an integer with `,` thousands separators (`1234567` -> `1,234,567`).
pub fn format_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Masks the password of a connection string so it can be logged.
///
/// Strings that do not parse as URLs are masked between the first `:` after
/// the scheme and the `@`.
pub fn redact_password(connection_string: &str) -> String {
    if let Ok(mut url) = Url::parse(connection_string) {
        if url.password().is_some() && url.set_password(Some("****")).is_ok() {
            return url.to_string();
        }
        return connection_string.to_string();
    }

    let Some(at) = connection_string.rfind('@') else {
        return connection_string.to_string();
    };
    let start = connection_string.find("://").map(|i| i + 3).unwrap_or(0);
    match connection_string[start..at].find(':') {
        Some(colon) => format!(
            "{}:****{}",
            &connection_string[..start + colon],
            &connection_string[at..]
        ),
        None => connection_string.to_string(),
    }
}
