//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the gateway core MUST NOT call sleep methods,
//! and integration tests MUST NOT block a thread with `std::thread::sleep`.
//! **Exceptions**: Exponential backoff in retry logic, timers raced against a
//! cancellation token, periodic tasks, unit-test modules.

use std::fs;
use std::path::{Path, PathBuf};

fn workspace_dir(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - A timer inside tokio::select! alongside cancel.cancelled()");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - #[cfg(test)] modules");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for events (use Notify or channels)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Integration tests drive time with `start_paused`, never the wall clock
#[test]
fn test_no_thread_sleep_in_integration_tests() {
    let dir = workspace_dir("gateway/core/tests");
    let mut violations = Vec::new();
    for path in rust_files(&dir) {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            let code_part = line.split("//").next().unwrap_or(line);
            if code_part.contains("thread::sleep(") {
                violations.push(format!("{}:{} - {}", path.display(), idx + 1, line.trim()));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "thread::sleep in integration tests:\n{}",
        violations.join("\n")
    );
}

/// Find all sleep() calls in production code
fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    check_directory(
        &workspace_dir("gateway/core/src"),
        &mut violations,
        &SleepPolicy {
            allow_backoff: true,
            allow_cancellable: true,
        },
    );

    violations
}

struct SleepPolicy {
    allow_backoff: bool,
    allow_cancellable: bool,
}

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_directory(dir: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    assert!(dir.exists(), "source directory missing: {}", dir.display());
    for path in rust_files(dir) {
        check_file(&path, violations, policy);
    }
}

fn check_file(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = production_lines(&content);

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;

        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        if code_part.contains("::sleep(") || code_part.contains(".sleep(") {
            if policy.allow_backoff && is_backoff_context(&lines, idx) {
                continue;
            }

            if policy.allow_cancellable && is_cancellable_timer(&lines, idx) {
                continue;
            }

            if is_interval_pattern(&lines, idx) {
                continue;
            }

            violations.push(format!(
                "{}:{} - {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }
    }
}

/// Lines before the first `#[cfg(test)]`
fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !line.trim().starts_with("#[cfg(test)]"))
        .collect()
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for i in context_range {
        let line = lines[i].to_lowercase();

        // 2^n pattern or bit shift
        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }

        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// A timer raced against cancellation inside `select!` is a deadline, not a poll
fn is_cancellable_timer(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(3)..std::cmp::min(current_idx + 3, lines.len());

    let mut in_select = false;
    let mut has_cancel = false;
    for i in context_range {
        let line = lines[i];
        if line.contains("select!") {
            in_select = true;
        }
        if line.contains(".cancelled()") {
            has_cancel = true;
        }
    }
    in_select && has_cancel
}

/// Check if this is tokio::time::interval pattern (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(20)..current_idx;

    for i in context_range {
        let line = lines[i];
        if line.contains("interval.tick()") || line.contains("tokio::time::interval") {
            return true;
        }
    }

    let forward_range = current_idx..std::cmp::min(current_idx + 5, lines.len());
    for i in forward_range {
        let line = lines[i];
        if line.contains("interval.tick()") {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_detection() {
        let test_code = vec![
            "fn reconnect() {",
            "    let delay = base_delay * (1 << attempt);",
            "    println!(\"Retry attempt {}\", attempt);",
            "    tokio::time::sleep(Duration::from_millis(delay)).await;",
            "}",
        ];

        assert!(
            is_backoff_context(&test_code, 3),
            "Should detect exponential backoff pattern"
        );
    }

    #[test]
    fn test_cancellable_timer_detection() {
        let raced = vec![
            "tokio::select! {",
            "    () = cancel.cancelled() => {}",
            "    () = tokio::time::sleep(retry_delay) => {}",
            "}",
        ];
        assert!(is_cancellable_timer(&raced, 2));

        let bare = vec!["loop {", "    tokio::time::sleep(poll).await;", "}"];
        assert!(!is_cancellable_timer(&bare, 1));
        assert!(!is_backoff_context(&bare, 1));
    }

    #[test]
    fn test_test_modules_are_skipped() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { std::thread::sleep(d); }\n}\n";
        assert_eq!(production_lines(source), vec!["fn a() {}"]);
    }
}
