//! Configuration validation with unknown field detection.
//!
//! Unknown keys are ignored when the config loads, so they are reported as
//! warnings. Values that would break startup are errors.

use serde_json::{Map, Value};

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &["logging", "runtime", "health", "launcher"];

/// Known fields for each section.
const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    ("logging", &["format", "level", "file"]),
    (
        "runtime",
        &["runtime_type", "allow_fallback_to_native", "docker", "native"],
    ),
    ("health", &["interval_ms", "timeout_ms", "retries", "start_period_ms"]),
    ("launcher", &["check_ports"]),
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn unknown_keys(obj: &Map<String, Value>, known: &[&str], prefix: &str) -> Vec<Diagnostic> {
    obj.keys()
        .filter(|key| !known.contains(&key.as_str()))
        .map(|key| {
            let message = match suggest_field(key, known) {
                Some(suggestion) => format!("Unknown field '{}', {}", key, suggestion),
                None => format!("Unknown field '{}'", key),
            };
            Diagnostic {
                level: DiagnosticLevel::Warn,
                path: if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                },
                message,
            }
        })
        .collect()
}

/// Validate a raw JSON config value against known field names.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Error,
                path: String::new(),
                message: "Config must be a JSON object".to_string(),
            });
            return diagnostics;
        }
    };

    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::Ok,
        path: String::new(),
        message: "Valid JSON".to_string(),
    });

    let mut unknown = unknown_keys(obj, KNOWN_TOP_LEVEL, "");
    for (section, known) in KNOWN_SECTIONS {
        if let Some(section_obj) = obj.get(*section).and_then(|v| v.as_object()) {
            unknown.extend(unknown_keys(section_obj, known, section));
        }
    }

    if unknown.is_empty() {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: "All fields recognized".to_string(),
        });
    } else {
        diagnostics.extend(unknown);
    }

    if let Some(health) = obj.get("health").and_then(|v| v.as_object()) {
        if health.get("retries").and_then(|v| v.as_u64()) == Some(0) {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Error,
                path: "health.retries".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        for key in ["interval_ms", "timeout_ms"] {
            if health.get(key).and_then(|v| v.as_u64()) == Some(0) {
                diagnostics.push(Diagnostic {
                    level: DiagnosticLevel::Error,
                    path: format!("health.{}", key),
                    message: "Must be greater than zero".to_string(),
                });
            }
        }
    }

    if let Some(launcher) = obj.get("launcher").and_then(|v| v.as_object()) {
        if launcher.get("check_ports").and_then(|v| v.as_bool()) == Some(false) {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Warn,
                path: "launcher.check_ports".to_string(),
                message: "Disabled; port conflicts surface as runtime errors instead"
                    .to_string(),
            });
        }
    }

    diagnostics
}
