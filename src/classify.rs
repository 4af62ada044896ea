//! Security-aware classification of literal values.
//!
//! Maps a literal string or number to a categorical token used as the
//! `LOAD_CONST` argument. Classification is deterministic and side-effect
//! free: structure categories are checked first (first match wins, fixed
//! order), then short strings stay verbatim and long ones fall into size
//! buckets.

use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

/// Categorical tokens substituted for values that are security-relevant or
/// too variable to tokenize verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    SensitivePath,
    Localhost,
    Version,
    UrlInsecure,
    Url,
    InsecureProtocol,
    Email,
    Ip,
    Path,
    Base64,
    Hex,
    Bash,
    Sql,
    Code,
    StringXs,
    StringS,
    StringM,
    StringL,
    StringXl,
    Integer,
    IntegerLarge,
    Float,
    Boolean,
    NoneValue,
    Truncated,
}

impl Category {
    /// Canonical token text. String categories keep the uppercase family
    /// form; numeric categories are plain lowercase words.
    pub fn token(&self) -> &'static str {
        match self {
            Self::SensitivePath => "STRING_SENSITIVE_FILE_PATH",
            Self::Localhost => "STRING_LOCALHOST",
            Self::Version => "STRING_VERSION",
            Self::UrlInsecure => "STRING_URL_INSECURE",
            Self::Url => "STRING_URL",
            Self::InsecureProtocol => "STRING_INSECURE_PROTOCOL",
            Self::Email => "STRING_EMAIL",
            Self::Ip => "STRING_IP",
            Self::Path => "STRING_PATH",
            Self::Base64 => "STRING_BASE64",
            Self::Hex => "STRING_HEX",
            Self::Bash => "STRING_BASH",
            Self::Sql => "STRING_SQL",
            Self::Code => "STRING_CODE",
            Self::StringXs => "STRING_XS",
            Self::StringS => "STRING_S",
            Self::StringM => "STRING_M",
            Self::StringL => "STRING_L",
            Self::StringXl => "STRING_XL",
            Self::Integer => "integer",
            Self::IntegerLarge => "integer_large",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::NoneValue => "none",
            Self::Truncated => "TRUNCATED",
        }
    }
}

/// Result of classifying a string literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrClass {
    /// Short generic string, kept as-is (lowercased for stability).
    Verbatim(String),
    Category(Category),
}

/// Integers beyond this magnitude land in the INTEGER_LARGE bucket.
const LARGE_INTEGER_BOUND: i64 = 1 << 32;

/// Size bucket for a string of the given character length.
pub fn size_bucket(len: usize) -> Category {
    match len {
        0..=4 => Category::StringXs,
        5..=15 => Category::StringS,
        16..=127 => Category::StringM,
        128..=4095 => Category::StringL,
        _ => Category::StringXl,
    }
}

pub fn classify_int(value: i64) -> Category {
    if value.unsigned_abs() > LARGE_INTEGER_BOUND as u64 {
        Category::IntegerLarge
    } else {
        Category::Integer
    }
}

/// Classify a string literal. `sensitive_paths` is the frozen table of
/// credential/key locations; `short_threshold` is the verbatim cutoff.
pub fn classify_str(
    value: &str,
    sensitive_paths: &rustc_hash::FxHashSet<String>,
    short_threshold: usize,
) -> StrClass {
    let trimmed = collapse_whitespace(value);

    if let Some(category) = structure_category(&trimmed, sensitive_paths) {
        return StrClass::Category(category);
    }

    if trimmed.chars().count() < short_threshold {
        StrClass::Verbatim(trimmed.to_lowercase())
    } else {
        StrClass::Category(size_bucket(trimmed.chars().count()))
    }
}

/// Structure categories, first match wins. Checked for strings of any
/// length so that short shell commands and addresses still classify.
fn structure_category(
    s: &str,
    sensitive_paths: &rustc_hash::FxHashSet<String>,
) -> Option<Category> {
    if s.is_empty() {
        return None;
    }
    if sensitive_paths.contains(s) {
        return Some(Category::SensitivePath);
    }
    if is_localhost(s) {
        return Some(Category::Localhost);
    }
    if is_version(s) {
        return Some(Category::Version);
    }
    if is_insecure_url(s) {
        return Some(Category::UrlInsecure);
    }
    if is_url(s) {
        return Some(Category::Url);
    }
    if is_insecure_protocol(s) {
        return Some(Category::InsecureProtocol);
    }
    if is_email(s) {
        return Some(Category::Email);
    }
    if is_ip(s) {
        return Some(Category::Ip);
    }
    if is_file_path(s) {
        return Some(Category::Path);
    }
    if is_base64(s) {
        return Some(Category::Base64);
    }
    if is_hex(s) {
        return Some(Category::Hex);
    }
    if is_bash(s) {
        return Some(Category::Bash);
    }
    if is_sql(s) {
        return Some(Category::Sql);
    }
    if is_code(s) {
        return Some(Category::Code);
    }
    None
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Schemes that transmit in the clear.
const INSECURE_SCHEMES: &[&str] = &["http", "ftp", "telnet", "ldap", "gopher"];

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?\d+(\.\d+){1,3}(?:[-.](?:a|b|rc|alpha|beta|dev|post)\.?\d*)?$").unwrap()
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^\s/]+\S*$").unwrap());

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,}$").unwrap()
});

static BASE64_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").unwrap());

static SHELL_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[a-zA-Z_]|\$\{[^}]+\}").unwrap());

static SHELL_SUBST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\([^)]+\)|`[^`]+`").unwrap());

static SHELL_OPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)-{1,2}[a-zA-Z][a-zA-Z0-9-]*").unwrap());

static SHELL_REDIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"2>&1|&>|>>|\|\s*\w|;\s*\w").unwrap());

fn is_version(s: &str) -> bool {
    // Dotted quads parse as versions too; they belong to the IP category.
    if s.parse::<Ipv4Addr>().is_ok() {
        return false;
    }
    VERSION_RE.is_match(s)
}

fn is_url(s: &str) -> bool {
    if URL_RE.is_match(s) {
        return true;
    }
    s.starts_with("www.") && s.len() > 8 && !s.contains(' ') && s.matches('.').count() >= 2
}

fn is_insecure_url(s: &str) -> bool {
    let Some((scheme, _)) = s.split_once("://") else {
        return false;
    };
    INSECURE_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) && is_url(s)
}

/// A bare protocol token without a URL around it ("ftp", "telnet", ...).
fn is_insecure_protocol(s: &str) -> bool {
    let lowered = s.to_ascii_lowercase();
    INSECURE_SCHEMES.contains(&lowered.as_str())
        || INSECURE_SCHEMES.iter().any(|p| lowered == format!("{p}:"))
}

fn is_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

fn is_ip(s: &str) -> bool {
    if s.contains('%') {
        return false;
    }
    s.parse::<Ipv4Addr>().is_ok() || s.parse::<Ipv6Addr>().is_ok()
}

fn is_localhost(s: &str) -> bool {
    let lowered = s.to_ascii_lowercase();
    matches!(lowered.as_str(), "localhost" | "127.0.0.1" | "::1" | "0.0.0.0")
        || lowered.starts_with("localhost:")
        || lowered.starts_with("127.0.0.1:")
}

const PATH_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".txt", ".json", ".xml", ".html", ".css", ".sh", ".bat", ".exe", ".dll",
    ".so", ".dylib", ".zip", ".tar", ".gz", ".pdf", ".csv", ".log", ".conf", ".cfg", ".ini",
    ".yaml", ".yml", ".md", ".tmp", ".bak", ".whl", ".pem", ".key",
];

const PATH_PREFIXES: &[&str] = &[
    "/bin/", "/usr/", "/etc/", "/var/", "/tmp/", "/home/", "/opt/", "/dev/", "/proc/",
    "/sys/", "/Library/", "/System/", "/Applications/", "C:\\Windows", "C:\\Program",
];

fn is_file_path(s: &str) -> bool {
    if s.len() < 2 || s.contains("://") || s.starts_with("mailto:") || s.starts_with("data:") {
        return false;
    }
    if s.starts_with('/') || s.starts_with("~/") || s.starts_with("./") || s.starts_with("../") {
        // Bare "/" or whitespace-bearing strings are commands, not paths.
        return !s.contains(' ') && s.len() > 1;
    }
    if s.starts_with("\\\\") {
        return true;
    }
    let win_drive = s.len() > 2
        && s.as_bytes()[1] == b':'
        && s.as_bytes()[0].is_ascii_alphabetic()
        && (s.as_bytes()[2] == b'\\' || s.as_bytes()[2] == b'/');
    if win_drive {
        return true;
    }
    if PATH_PREFIXES.iter().any(|p| s.contains(p)) && !s.contains(' ') {
        return true;
    }
    let lowered = s.to_ascii_lowercase();
    let has_extension = PATH_EXTENSIONS.iter().any(|e| lowered.ends_with(e));
    let has_separator = s.contains('/') || s.contains('\\');
    has_extension && (has_separator || !s.contains(' '))
}

fn is_base64(s: &str) -> bool {
    // Strict alphabet, block length, and at most two trailing pads. The
    // length floor keeps ordinary identifiers out of the bucket.
    if s.len() < 16 || s.len() % 4 != 0 {
        return false;
    }
    if !BASE64_RE.is_match(s) {
        return false;
    }
    // Mixed-case or digit content distinguishes encodings from words.
    let has_digit = s.bytes().any(|b| b.is_ascii_digit());
    let has_upper = s.bytes().any(|b| b.is_ascii_uppercase());
    let has_lower = s.bytes().any(|b| b.is_ascii_lowercase());
    has_digit && has_upper && has_lower
}

fn is_hex(s: &str) -> bool {
    let body = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    body.len() >= 8 && body.len() % 2 == 0 && body.bytes().all(|b| b.is_ascii_hexdigit())
}

const BASH_KEYWORDS: &[&str] = &[
    "ls", "cd", "echo", "rm", "grep", "awk", "sed", "cat", "curl", "wget", "sudo", "chmod",
    "chown", "mkdir", "touch", "cp", "mv", "find", "xargs", "tar", "gzip", "unzip", "ps",
    "kill", "pkill", "mount", "export", "source", "eval", "exec", "nohup", "bash", "sh",
    "nc", "ssh", "scp", "rsync", "git", "docker", "npm", "pip", "apt", "yum", "brew",
    "systemctl", "crontab", "sleep", "head", "tail", "tee", "whoami", "uname",
];

fn is_bash(s: &str) -> bool {
    let mut score = 0u32;
    let lowered = s.to_ascii_lowercase();

    if lowered.starts_with("#!/bin/") || lowered.starts_with("#!/usr/bin/") {
        score += 10;
    }

    let keyword_hits = lowered
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| BASH_KEYWORDS.contains(w))
        .collect::<rustc_hash::FxHashSet<_>>()
        .len();
    score += match keyword_hits {
        0 => 0,
        1 => 2,
        2 => 3,
        _ => 4,
    };

    if SHELL_VAR_RE.is_match(s) {
        score += 2;
    }
    if SHELL_SUBST_RE.is_match(s) {
        score += 3;
    }
    if SHELL_OPT_RE.is_match(s) {
        score += 1;
    }
    if SHELL_REDIR_RE.is_match(s) {
        score += 2;
    }

    score >= 3
}

static SQL_PRIMARY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bselect\s+[\w\*,\s\.]+\s+from\s+[\w\.]+",
        r"(?i)\binsert\s+into\s+\w+",
        r"(?i)\bupdate\s+\w+\s+set\s+\w+\s*=",
        r"(?i)\bdelete\s+from\s+\w+",
        r"(?i)\b(create|alter|drop)\s+(table|database|view|index)\s+\w+",
        r"(?i)\btruncate\s+table\s+\w+",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SQL_SECONDARY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bwhere\s+\w+\s*[=<>!]",
        r"(?i)\bgroup\s+by\s+\w+",
        r"(?i)\border\s+by\s+\w+",
        r"(?i)\b(left|right|inner|outer)\s+join\s+\w+",
        r"(?i)\bunion\s+(all\s+)?select",
        r"(?i)\blike\s+'[^']*'",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn is_sql(s: &str) -> bool {
    if SQL_PRIMARY_RES.iter().any(|re| re.is_match(s)) {
        return true;
    }
    SQL_SECONDARY_RES.iter().filter(|re| re.is_match(s)).count() >= 2
}

const CODE_KEYWORDS: &[&str] = &[
    "if", "else", "elif", "for", "while", "return", "yield", "function", "def", "class",
    "import", "from", "require", "const", "let", "var", "true", "false", "null", "none",
    "try", "catch", "except", "throw", "raise", "new", "lambda", "async", "await", "self",
    "this", "typeof", "instanceof",
];

static CODE_PATTERN_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"</?\s*\w+[^>]*>",
        r"==|!=|<=|>=|\+=|=>|->",
        r"(?m)^\s*(//|#|/\*)",
        r"\b(def|function)\s+\w+\s*\(",
        r"[\[\]\{\}]",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Heuristic code-likeness score over symbol density, keywords, structural
/// patterns, and indentation. Threshold 0.25 in score units of 0.1.
fn is_code(s: &str) -> bool {
    let mut score = 0u32; // tenths

    let len = s.chars().count();
    let symbols = s.chars().filter(|c| !c.is_alphanumeric() && !c.is_whitespace()).count();
    let density = symbols as f64 / len.max(1) as f64;
    if density > 0.12 && density <= 0.6 {
        score += 4;
    } else if density > 0.05 {
        score += 2;
    }

    let keyword_hits = s
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| CODE_KEYWORDS.contains(w))
        .collect::<rustc_hash::FxHashSet<_>>()
        .len();
    score += match keyword_hits {
        0 => 0,
        1 => 3,
        2 => 5,
        _ => 6,
    };

    score += CODE_PATTERN_RES.iter().filter(|re| re.is_match(s)).count() as u32 * 2;

    score >= 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    fn classify(value: &str) -> StrClass {
        let sensitive: FxHashSet<String> =
            ["/etc/passwd", "~/.ssh/id_rsa", "~/.aws/credentials"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        classify_str(value, &sensitive, 15)
    }

    #[test]
    fn short_generic_strings_stay_verbatim_lowercased() {
        assert_eq!(classify("Hello"), StrClass::Verbatim("hello".into()));
        assert_eq!(classify("ls"), StrClass::Verbatim("ls".into()));
        assert_eq!(classify("some_var"), StrClass::Verbatim("some_var".into()));
    }

    #[test]
    fn long_generic_strings_fall_into_size_buckets() {
        assert_eq!(classify(&"a b".repeat(20)), StrClass::Category(Category::StringM));
        assert_eq!(classify(&"word ".repeat(100)), StrClass::Category(Category::StringL));
        assert_eq!(classify(&"word ".repeat(1000)), StrClass::Category(Category::StringXl));
    }

    #[test]
    fn structure_checks_run_before_the_length_cut() {
        // Short but clearly a shell command.
        assert_eq!(classify("rm -rf /"), StrClass::Category(Category::Bash));
        assert_eq!(classify("1.2.3"), StrClass::Category(Category::Version));
        assert_eq!(classify("10.0.0.1"), StrClass::Category(Category::Ip));
    }

    #[test]
    fn urls_and_protocols() {
        assert_eq!(
            classify("https://example.com/payload"),
            StrClass::Category(Category::Url)
        );
        assert_eq!(
            classify("http://evil.example.com/x"),
            StrClass::Category(Category::UrlInsecure)
        );
        assert_eq!(
            classify("ftp://files.example.com/a.tar"),
            StrClass::Category(Category::UrlInsecure)
        );
        assert_eq!(classify("telnet"), StrClass::Category(Category::InsecureProtocol));
    }

    #[test]
    fn addresses_and_paths() {
        assert_eq!(classify("root@example.com"), StrClass::Category(Category::Email));
        assert_eq!(classify("192.168.2.44"), StrClass::Category(Category::Ip));
        assert_eq!(classify("localhost:8080"), StrClass::Category(Category::Localhost));
        assert_eq!(classify("/usr/lib/firmware"), StrClass::Category(Category::Path));
        assert_eq!(classify("../config/settings.yaml"), StrClass::Category(Category::Path));
        assert_eq!(classify("/etc/passwd"), StrClass::Category(Category::SensitivePath));
    }

    #[test]
    fn encodings() {
        let blob = "aGVsbG8gd29ybGQgd2l0aCBwYWRkaW5nIDEyMzQ1Ng==";
        assert_eq!(classify(blob), StrClass::Category(Category::Base64));
        assert_eq!(classify("deadbeefdeadbeef"), StrClass::Category(Category::Hex));
        assert_eq!(classify("0x41414141"), StrClass::Category(Category::Hex));
        // Plain English words must not look like base64.
        assert!(matches!(classify("organization"), StrClass::Verbatim(_)));
    }

    #[test]
    fn bash_and_sql_need_real_evidence() {
        assert_eq!(
            classify("curl http.example | bash -s -- --install"),
            StrClass::Category(Category::Bash)
        );
        assert_eq!(
            classify("SELECT name, pass FROM users WHERE admin = 1"),
            StrClass::Category(Category::Sql)
        );
        // One keyword alone is not a script.
        assert_eq!(classify("ls"), StrClass::Verbatim("ls".into()));
    }

    #[test]
    fn code_detection() {
        let snippet = "def handler(x):\n    if x:\n        return x + 1";
        assert_eq!(classify(snippet), StrClass::Category(Category::Code));
    }

    #[test]
    fn numeric_buckets() {
        assert_eq!(classify_int(5), Category::Integer);
        assert_eq!(classify_int(-42), Category::Integer);
        assert_eq!(classify_int(1 << 40), Category::IntegerLarge);
    }

    #[test]
    fn classification_is_deterministic() {
        for value in ["rm -rf /", "hello", "192.168.2.44", &"x".repeat(5000)] {
            assert_eq!(classify(value), classify(value));
        }
    }
}
