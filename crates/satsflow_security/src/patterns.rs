//! Fixed table of dangerous source patterns.
//!
//! These are textual matchers applied to the raw source after the AST
//! checks: process spawning, raw sockets, dynamic code execution,
//! reflection into interpreter internals, environment and filesystem
//! escape. Any match is a hard failure in both modes. Import statements
//! are deliberately absent here; the allow-list check owns those and
//! reports them as `ImportViolation`.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SecurityError;

static DANGEROUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"subprocess\.", "subprocess usage"),
        (r"sys\.(exit|_exit|path|argv)", "sys internals access"),
        (r"socket\.", "raw socket usage"),
        (r"eval\s*\(", "eval call"),
        (r"exec\s*\(", "exec call"),
        (r"os\.system\s*\(", "shell command execution"),
        (r"__import__\s*\(", "dynamic import"),
        (r#"getattr\s*\(.+?,\s*['"]__"#, "dunder reflection"),
        (r"globals\s*\(\s*\)", "globals() access"),
        (r"locals\s*\(\s*\)", "locals() access"),
        (r"compile\s*\(", "code compilation"),
        (r"importlib", "importlib usage"),
        (r#"open\s*\(.+?,\s*['"]w"#, "file opened for writing"),
        (r"shutil\.", "shutil file operations"),
        (r"os\.path\.expanduser\s*\(", "user directory lookup"),
        (r"os\.environ", "environment variable access"),
    ]
    .into_iter()
    .map(|(pattern, what)| {
        (
            Regex::new(pattern).expect("dangerous-pattern table regex must compile"),
            what,
        )
    })
    .collect()
});

/// Scan raw source against the pattern table. First match fails hard.
pub fn scan(source: &str) -> Result<(), SecurityError> {
    for (pattern, what) in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(source) {
            return Err(SecurityError::DangerousPattern {
                reason: format!("{what} (matched `{}`)", pattern.as_str()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_passes() {
        let source = "import pandas as pd\nweights = pd.Series(dtype=float)\n";
        assert!(scan(source).is_ok());
    }

    #[test]
    fn test_eval_is_rejected() {
        let err = scan("result = eval('2 + 2')\n").unwrap_err();
        assert_eq!(err.kind(), "dangerous_pattern");
        assert!(err.to_string().contains("eval"));
    }

    #[test]
    fn test_environment_access_is_rejected() {
        assert!(scan("home = os.environ['HOME']\n").is_err());
    }

    #[test]
    fn test_open_for_write_is_rejected() {
        assert!(scan("f = open('out.txt', 'w')\n").is_err());
        // Reading is not matched by this table.
        assert!(scan("f = open('in.txt', 'r')\n").is_ok());
    }

    #[test]
    fn test_dunder_reflection_is_rejected() {
        assert!(scan("cls = getattr(obj, '__class__')\n").is_err());
    }
}
