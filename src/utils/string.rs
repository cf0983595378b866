//! UTF-8 safe helpers for trimming probe and runtime output.

/// Return the first `n` characters of `s` as a `String` (no ellipsis).
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Condense captured process output into a single short line for error
/// messages: the last non-empty line, clipped to `n` characters.
pub fn output_summary(output: &str, n: usize) -> String {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let mut summary = prefix_chars(line, n);
    if line.chars().count() > n {
        summary.push_str("...");
    }
    summary
}
