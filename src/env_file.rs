//! `.env` support: `KEY=value` lines seeding the process environment.
//!
//! Variables already present in the environment are never overwritten.

use std::fs;
use std::path::Path;

/// Read `path` and export every assignment whose key is not yet set.
/// Returns the number of variables exported.
pub fn load(path: &Path) -> Result<usize, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let assignments = parse(&content).map_err(|(line, e)| format!("{}:{}: {}", path.display(), line, e))?;

    let mut exported = 0;
    for (key, value) in assignments {
        if std::env::var_os(&key).is_none() {
            // Only called during single-threaded startup, before logging or any client exists.
            unsafe {
                std::env::set_var(key, value);
            }
            exported += 1;
        }
    }
    Ok(exported)
}

/// Parse a whole file. Errors carry the 1-based line number.
pub fn parse(content: &str) -> Result<Vec<(String, String)>, (usize, String)> {
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| (index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    if let Some(rest) = raw.strip_prefix('"') {
        let (value, tail) = unquote_double(rest)?;
        ensure_only_comment(tail, "double")?;
        Ok(value)
    } else if let Some(rest) = raw.strip_prefix('\'') {
        let end = rest.find('\'').ok_or_else(|| "unterminated single-quoted value".to_string())?;
        ensure_only_comment(&rest[end + 1..], "single")?;
        Ok(rest[..end].to_string())
    } else {
        // Unquoted: an inline comment starts at '#'
        let value = raw.split('#').next().unwrap_or_default();
        Ok(value.trim_end().to_string())
    }
}

/// Returns the unescaped value and whatever follows the closing quote.
fn unquote_double(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            other => value.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}

fn ensure_only_comment(tail: &str, quote: &str) -> Result<(), String> {
    let tail = tail.trim();
    if tail.is_empty() || tail.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected characters after closing {} quote", quote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(content: &str) -> Vec<(String, String)> {
        parse(content).unwrap()
    }

    #[test]
    fn parses_plain_quoted_and_exported_assignments() {
        let content = r#"
# Dropbox credentials
DROPBOX_APP_KEY=abc123
export DROPBOX_APP_SECRET = "s3cr\"et" # trailing
DROPBOX_UPLOAD_PATH='/data/air quality.sqlite'
AQ_CACHE_DIR=/var/cache/aqi # inline comment
EMPTY=
"#;
        assert_eq!(
            pairs(content),
            vec![
                ("DROPBOX_APP_KEY".to_string(), "abc123".to_string()),
                ("DROPBOX_APP_SECRET".to_string(), "s3cr\"et".to_string()),
                ("DROPBOX_UPLOAD_PATH".to_string(), "/data/air quality.sqlite".to_string()),
                ("AQ_CACHE_DIR".to_string(), "/var/cache/aqi".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn double_quotes_support_escapes() {
        assert_eq!(pairs(r#"A="line\nnext\ttab\\""#), vec![("A".to_string(), "line\nnext\ttab\\".to_string())]);
    }

    #[test]
    fn reports_line_numbers() {
        assert_eq!(parse("A=1\n\nNOPE\n").unwrap_err().0, 3);
        assert!(parse("A=\"open").is_err());
        assert!(parse("A='open").is_err());
        assert!(parse("A=\"x\" y").is_err());
        assert!(parse("MY KEY=1").is_err());
        assert!(parse("=1").is_err());
    }

    #[test]
    fn load_does_not_override_existing_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "AQI_DASHBOARD_TEST_FRESH=from-file\nPATH=overridden\n").unwrap();

        let exported = load(&path).unwrap();

        assert_eq!(exported, 1);
        assert_eq!(std::env::var("AQI_DASHBOARD_TEST_FRESH").unwrap(), "from-file");
        assert_ne!(std::env::var("PATH").unwrap(), "overridden");
    }
}
