use crate::config::OutputLimits;
use crate::types::StructuredOutput;

/// Prefix of a stdout line carrying a structured output.
pub const OUTPUT_MARKER: &str = "@@output ";

/// Stdout and stderr text plus structured outputs, all within their caps.
#[derive(Debug)]
pub(crate) struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub structured: Vec<StructuredOutput>,
}

/// Lift marker lines out of stdout and apply every cap.
///
/// `stdout_dropped`/`stderr_dropped` are bytes the backend already discarded;
/// they are reported in the truncation marker together with anything cut here.
pub(crate) fn collect(
    stdout: &[u8],
    stdout_dropped: usize,
    stderr: &[u8],
    stderr_dropped: usize,
    limits: &OutputLimits,
) -> CapturedOutput {
    let stdout = String::from_utf8_lossy(stdout);
    let (plain, structured) = extract_structured(&stdout, limits);
    CapturedOutput {
        stdout: truncate(&plain, limits.max_stdout_bytes, stdout_dropped),
        stderr: truncate(
            &String::from_utf8_lossy(stderr),
            limits.max_stderr_bytes,
            stderr_dropped,
        ),
        structured,
    }
}

fn extract_structured(stdout: &str, limits: &OutputLimits) -> (String, Vec<StructuredOutput>) {
    let mut plain = String::with_capacity(stdout.len());
    let mut outputs = Vec::new();
    let mut used_bytes = 0usize;
    let mut omitted = 0usize;

    for line in stdout.split_inclusive('\n') {
        let parsed = line
            .strip_prefix(OUTPUT_MARKER)
            .and_then(|json| serde_json::from_str::<StructuredOutput>(json.trim_end()).ok());
        let Some(output) = parsed else {
            plain.push_str(line);
            continue;
        };

        let size = line.len() - OUTPUT_MARKER.len();
        if outputs.len() < limits.max_outputs && used_bytes + size <= limits.max_output_bytes {
            used_bytes += size;
            outputs.push(output);
        } else {
            omitted += 1;
        }
    }

    if omitted > 0 {
        outputs.push(StructuredOutput {
            kind: "truncated".to_string(),
            data: serde_json::json!({ "omitted": omitted }),
        });
    }
    (plain, outputs)
}

/// Cut `text` to at most `max` bytes on a char boundary, appending a marker
/// whenever anything was lost.
pub(crate) fn truncate(text: &str, max: usize, already_dropped: usize) -> String {
    let mut cut = text.len().min(max);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut + already_dropped;
    if omitted == 0 {
        return text.to_string();
    }
    let mut out = text.get(..cut).unwrap_or_default().to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("[... output truncated: {omitted} bytes omitted]"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> OutputLimits {
        OutputLimits {
            max_stdout_bytes: 32,
            max_stderr_bytes: 16,
            max_outputs: 2,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn marker_lines_leave_stdout() {
        let stdout = b"hello\n@@output {\"kind\":\"table\",\"data\":[1,2]}\nworld\n";
        let out = collect(stdout, 0, b"", 0, &limits());
        assert_eq!(out.stdout, "hello\nworld\n");
        assert_eq!(out.structured.len(), 1);
        assert_eq!(out.structured[0].kind, "table");
        assert_eq!(out.structured[0].data, serde_json::json!([1, 2]));
    }

    #[test]
    fn malformed_marker_stays_in_stdout() {
        let stdout = b"@@output not json\n";
        let out = collect(stdout, 0, b"", 0, &limits());
        assert_eq!(out.stdout, "@@output not json\n");
        assert!(out.structured.is_empty());
    }

    #[test]
    fn structured_count_cap_appends_marker() {
        let line = "@@output {\"kind\":\"k\"}\n";
        let stdout = line.repeat(5);
        let out = collect(stdout.as_bytes(), 0, b"", 0, &limits());
        assert_eq!(out.structured.len(), 3);
        let last = out.structured.last().unwrap();
        assert_eq!(last.kind, "truncated");
        assert_eq!(last.data["omitted"], 3);
    }

    #[test]
    fn text_truncation_is_explicit() {
        let stdout = "x".repeat(40);
        let out = collect(stdout.as_bytes(), 0, b"short", 0, &limits());
        assert!(out.stdout.starts_with(&"x".repeat(32)));
        assert!(out.stdout.ends_with("[... output truncated: 8 bytes omitted]"));
        assert_eq!(out.stderr, "short");
    }

    #[test]
    fn backend_drops_are_reported() {
        let out = collect(b"ok\n", 100, b"", 0, &limits());
        assert_eq!(out.stdout, "ok\n[... output truncated: 100 bytes omitted]");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // "é" is two bytes; cutting at 3 would split the second one.
        let text = "éé";
        let out = truncate(text, 3, 0);
        assert!(out.starts_with("é\n"));
        assert!(out.ends_with("2 bytes omitted]"));
    }
}
