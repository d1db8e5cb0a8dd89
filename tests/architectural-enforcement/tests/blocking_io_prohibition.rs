//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the gateway core MUST NOT use blocking I/O.
//! **Required**: `tokio::fs` / `tokio::net`, or keep the blocking call in a
//! plain `fn` that runs before the runtime (config loading).
//!
//! Value types such as `std::net::IpAddr` are not I/O and are allowed.

use std::fs;
use std::path::{Path, PathBuf};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O in async code:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener, std::net::UdpSocket");
        eprintln!("  - std::process::Command");
        eprintln!("  - std::thread::sleep");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (before tokio runtime starts)");
        eprintln!("  - #[cfg(test)] modules");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all blocking I/O calls in production code
fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../gateway/core/src");
    assert!(src.exists(), "source directory missing: {}", src.display());

    for path in rust_files(&src) {
        check_file(&path, &mut violations);
    }

    violations
}

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

const BLOCKING_NET: [&str; 3] = ["TcpStream", "TcpListener", "UdpSocket"];

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = content
        .lines()
        .take_while(|line| !line.trim().starts_with("#[cfg(test)]"))
        .collect();

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;

        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        // A module-level import makes blocking calls look local; forbid it outright
        if code_part.trim_start().starts_with("use std::fs") {
            violations.push(format!(
                "{}:{} - Blocking file I/O import: {}",
                path.display(),
                line_number,
                line.trim()
            ));
            continue;
        }

        if is_in_non_async_function(&lines, idx) {
            continue;
        }

        if code_part.contains("std::fs::") {
            violations.push(format!(
                "{}:{} - Blocking file I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("std::net")
            && BLOCKING_NET.iter().any(|name| code_part.contains(name))
        {
            violations.push(format!(
                "{}:{} - Blocking network I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("std::process::Command") {
            violations.push(format!(
                "{}:{} - Blocking process I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("std::thread::sleep") {
            violations.push(format!(
                "{}:{} - Blocking sleep: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }
    }
}

/// `Some(true)` for an async fn signature, `Some(false)` for a plain fn
fn fn_signature(line: &str) -> Option<bool> {
    let mut rest = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") || rest.starts_with("const fn ") {
        Some(false)
    } else {
        None
    }
}

/// Check if line is inside a non-async function (acceptable for blocking I/O)
fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if let Some(is_async) = fn_signature(line) {
            return !is_async;
        }

        // Async blocks inside a plain fn run on the runtime
        if line.contains("async move {") || line.contains("async {") {
            return false;
        }

        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_is_not_exempt() {
        let test_code = vec![
            "    pub async fn load(&self) {",
            "        let contents = std::fs::read_to_string(\"file.txt\")?;",
            "    }",
        ];

        assert!(!is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn test_pub_fn_is_exempt() {
        let test_code = vec![
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {",
            "    let contents = std::fs::read_to_string(path)?;",
            "}",
        ];

        assert!(is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn test_async_block_in_plain_fn_is_not_exempt() {
        let test_code = vec![
            "pub fn spawn(&self) {",
            "    tokio::spawn(async move {",
            "        std::fs::write(\"x\", b\"y\").ok();",
            "    });",
            "}",
        ];

        assert!(!is_in_non_async_function(&test_code, 2));
    }

    #[test]
    fn test_fn_signature() {
        assert_eq!(fn_signature("pub(crate) async fn step("), Some(true));
        assert_eq!(fn_signature("fn apply_env_config("), Some(false));
        assert_eq!(fn_signature("let f = 1;"), None);
    }
}
