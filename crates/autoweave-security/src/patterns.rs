//! Fixed deny-pattern set for execute payloads and the dangerous-key scan.

use once_cell::sync::Lazy;
use regex::Regex;

/// A named deny rule
pub struct DenyPattern {
    pub name: &'static str,
    pub regex: Regex,
}

/// Patterns that block an `execute` payload outright
pub static DENY_PATTERNS: Lazy<Vec<DenyPattern>> = Lazy::new(|| {
    let rules: &[(&str, &str)] = &[
        ("subprocess-spawn", r"child_process|execSync|spawnSync|/bin/sh|/bin/bash"),
        ("dynamic-eval", r"\beval\s*\(|new\s+Function\s*\("),
        ("fs-module-escape", r#"require\s*\(\s*['"](fs|net|dgram|cluster)['"]\s*\)"#),
        ("env-exfiltration", r"process\.env\s*[\[\.]"),
        ("credential-paths", r"/etc/passwd|/etc/shadow|\.ssh/id_|\.aws/credentials"),
        ("prototype-pollution", r"__proto__|constructor\s*\[\s*['\x22]prototype"),
        ("raw-socket", r"net\.connect|Socket\s*\(|XMLHttpRequest"),
    ];

    rules
        .iter()
        .map(|(name, pattern)| DenyPattern {
            name,
            regex: Regex::new(pattern).expect("deny pattern is a valid regex"),
        })
        .collect()
});

/// Keys that are never allowed in message payloads (strict mode)
pub const DANGEROUS_KEYS: &[&str] = &["__proto__", "prototype", "constructor"];

/// Scan a code payload against the deny set. Returns the first matching
/// rule name.
pub fn scan_code(code: &str) -> Option<&'static str> {
    DENY_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(code))
        .map(|p| p.name)
}

/// Recursively scan a JSON value for dangerous keys. Returns the offending
/// key if one is found.
pub fn scan_keys(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                if let Some(bad) = DANGEROUS_KEYS.iter().find(|k| *k == key) {
                    return Some(bad);
                }
                if let Some(bad) = scan_keys(nested) {
                    return Some(bad);
                }
            }
            None
        }
        serde_json::Value::Array(items) => items.iter().find_map(scan_keys),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_code_matches() {
        assert_eq!(scan_code("const cp = child_process.exec('ls')"), Some("subprocess-spawn"));
        assert_eq!(scan_code("eval(payload)"), Some("dynamic-eval"));
        assert_eq!(scan_code("fetch('/etc/passwd')"), Some("credential-paths"));
        assert_eq!(scan_code("let x = 1 + 1;"), None);
    }

    #[test]
    fn test_scan_keys_nested() {
        let clean = json!({"device": {"vendor_id": 4660}});
        assert_eq!(scan_keys(&clean), None);

        let polluted = json!({"data": [{"__proto__": {"admin": true}}]});
        assert_eq!(scan_keys(&polluted), Some("__proto__"));

        let nested = json!({"a": {"b": {"constructor": 1}}});
        assert_eq!(scan_keys(&nested), Some("constructor"));
    }
}
