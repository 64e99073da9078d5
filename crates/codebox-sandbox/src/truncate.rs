//! Output previews and spill files.
//!
//! The full captured output of every execution is written to
//! `<output_dir>/<execution_id>.log` before previews are built, so nothing
//! the buffer retained is lost when the preview is cut.

use std::path::PathBuf;

use crate::output::CapturedOutput;
use crate::request::SupervisorConfig;

/// Inserted between the head and tail of a cut preview.
pub const PREVIEW_MARKER: &str = "...truncated...\n";

const STDERR_SECTION: &str = "--- stderr ---\n";

/// Bounded view of `text`: the first and last `lines` lines when it has more
/// than `2 * lines`, then capped at `max_bytes` (plus the marker) keeping
/// both ends.
pub fn preview(text: &str, lines: usize, max_bytes: usize) -> String {
    let all: Vec<&str> = text.split_inclusive('\n').collect();
    let by_lines = if all.len() > lines.saturating_mul(2) {
        let mut out = all[..lines].concat();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(PREVIEW_MARKER);
        out.push_str(&all[all.len() - lines..].concat());
        out
    } else {
        text.to_string()
    };

    if by_lines.len() <= max_bytes {
        return by_lines;
    }

    let half = max_bytes / 2;
    let head_end = floor_char_boundary(&by_lines, half);
    let tail_start = ceil_char_boundary(&by_lines, by_lines.len() - half);
    let mut out = String::with_capacity(max_bytes + PREVIEW_MARKER.len() + 1);
    out.push_str(&by_lines[..head_end]);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(PREVIEW_MARKER);
    out.push_str(&by_lines[tail_start..]);
    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    (0..=index.min(s.len()))
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    (index.min(s.len())..=s.len())
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(s.len())
}

/// Previews plus the location of the full output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedOutput {
    /// Bounded stdout.
    pub stdout_preview: String,
    /// Bounded stderr.
    pub stderr_preview: String,
    /// Spill file. `None` if it could not be written.
    pub full_path: Option<PathBuf>,
}

/// Builds previews and spills full output to disk.
#[derive(Debug, Clone)]
pub struct OutputTruncator {
    output_dir: PathBuf,
    preview_lines: usize,
    preview_max_bytes: usize,
}

impl OutputTruncator {
    /// Create a truncator writing spill files under `output_dir`.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        preview_lines: usize,
        preview_max_bytes: usize,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            preview_lines,
            preview_max_bytes,
        }
    }

    /// Create a truncator from supervisor settings.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.output_dir.clone(),
            config.preview_lines,
            config.preview_max_bytes,
        )
    }

    /// Spill `captured` to disk, then build previews.
    ///
    /// A failed spill is logged and reported as `full_path: None`; previews
    /// are still produced.
    pub async fn truncate(&self, execution_id: &str, captured: &CapturedOutput) -> TruncatedOutput {
        let full_path = match self.spill(execution_id, captured).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    dir = %self.output_dir.display(),
                    error = %e,
                    "failed to write full output"
                );
                None
            }
        };

        TruncatedOutput {
            stdout_preview: preview(&captured.stdout, self.preview_lines, self.preview_max_bytes),
            stderr_preview: preview(&captured.stderr, self.preview_lines, self.preview_max_bytes),
            full_path,
        }
    }

    async fn spill(
        &self,
        execution_id: &str,
        captured: &CapturedOutput,
    ) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(format!("{execution_id}.log"));
        tokio::fs::write(&path, render_full(captured)).await?;
        Ok(path)
    }
}

fn render_full(captured: &CapturedOutput) -> String {
    let mut full = String::with_capacity(
        captured.stdout.len() + captured.stderr.len() + STDERR_SECTION.len() + 1,
    );
    full.push_str(&captured.stdout);
    if !captured.stderr.is_empty() {
        if !full.is_empty() && !full.ends_with('\n') {
            full.push('\n');
        }
        full.push_str(STDERR_SECTION);
        full.push_str(&captured.stderr);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (0..n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn short_text_is_unchanged() {
        let text = numbered(10);
        assert_eq!(preview(&text, 5, 1024), text);
        assert_eq!(preview("", 5, 1024), "");
    }

    #[test]
    fn long_text_keeps_head_and_tail_lines() {
        let text = numbered(1000);
        let out = preview(&text, 3, 1 << 20);
        assert_eq!(
            out,
            format!("line 0\nline 1\nline 2\n{PREVIEW_MARKER}line 997\nline 998\nline 999\n")
        );
    }

    #[test]
    fn exactly_two_k_lines_is_not_cut() {
        let text = numbered(6);
        assert_eq!(preview(&text, 3, 1 << 20), text);
    }

    #[test]
    fn byte_cap_keeps_both_ends() {
        let text = format!("START{}END", "x".repeat(10_000));
        let out = preview(&text, 100, 64);
        assert!(out.starts_with("START"));
        assert!(out.ends_with("END"));
        assert!(out.contains(PREVIEW_MARKER));
        assert!(out.len() <= 64 + PREVIEW_MARKER.len() + 1);
    }

    #[test]
    fn byte_cap_respects_char_boundaries() {
        let text = "日本語".repeat(100);
        let out = preview(&text, 100, 17);
        assert!(out.contains(PREVIEW_MARKER));
        assert!(out.ends_with('語'));
    }

    #[tokio::test]
    async fn truncate_spills_full_output_before_previewing() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = OutputTruncator::new(dir.path(), 2, 1 << 20);
        let captured = CapturedOutput {
            stdout: numbered(50),
            stderr: "boom\n".into(),
            truncated: false,
        };

        let out = truncator.truncate("exec-1", &captured).await;
        let path = out.full_path.expect("spill path");
        assert_eq!(path, dir.path().join("exec-1.log"));

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.starts_with("line 0\n"));
        assert!(on_disk.contains("line 25\n"));
        assert!(on_disk.ends_with("--- stderr ---\nboom\n"));

        assert!(out.stdout_preview.contains(PREVIEW_MARKER));
        assert!(!out.stdout_preview.contains("line 25\n"));
        assert_eq!(out.stderr_preview, "boom\n");
    }

    #[tokio::test]
    async fn stderr_section_omitted_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let truncator = OutputTruncator::new(dir.path(), 10, 1024);
        let captured = CapturedOutput {
            stdout: "only stdout".into(),
            ..Default::default()
        };
        let out = truncator.truncate("exec-2", &captured).await;
        let on_disk = std::fs::read_to_string(out.full_path.unwrap()).unwrap();
        assert_eq!(on_disk, "only stdout");
    }

    #[tokio::test]
    async fn spill_failure_still_returns_previews() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let truncator = OutputTruncator::new(&blocker, 10, 1024);
        let captured = CapturedOutput {
            stdout: "hello\n".into(),
            ..Default::default()
        };
        let out = truncator.truncate("exec-3", &captured).await;
        assert!(out.full_path.is_none());
        assert_eq!(out.stdout_preview, "hello\n");
    }
}
