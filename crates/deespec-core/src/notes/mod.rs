//! Per-task append-only markdown notes.
//!
//! Every turn gets one section: a header naming the turn and timestamp,
//! a few metadata lines, a blank line, the free-text body with line
//! endings normalized to LF, and a trailing separator. Callers hand the
//! rendered section to [`deespec_store::NotesRepository::append_note`].

use chrono::{DateTime, Utc};
use deespec_store::models::{Decision, Step};

/// One turn's worth of note content.
pub struct NoteSection<'a> {
    pub turn: u32,
    pub ts: DateTime<Utc>,
    pub author: &'a str,
    pub step: Step,
    pub decision: Decision,
    pub summary: Option<&'a str>,
    pub body: &'a str,
}

/// Render a [`NoteSection`] to the markdown block appended to a task's
/// notes file.
pub fn render(section: &NoteSection) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "## Turn {} — {}\n",
        section.turn,
        section.ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    ));
    out.push_str(&format!("- Author: {}\n", section.author));
    out.push_str(&format!("- Step: {}\n", section.step));
    out.push_str(&format!("- Decision: {}\n", section.decision));
    if let Some(summary) = section.summary {
        out.push_str(&format!("- Summary: {summary}\n"));
    }
    out.push('\n');
    out.push_str(&normalize_line_endings(section.body));
    out.push_str("\n\n---\n");
    out
}

fn normalize_line_endings(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renders_required_header_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let section = NoteSection {
            turn: 3,
            ts,
            author: "claude-code",
            step: Step::Implement,
            decision: Decision::Pending,
            summary: Some("did a thing"),
            body: "line one\r\nline two",
        };

        let rendered = render(&section);
        assert!(rendered.starts_with("## Turn 3 — 2026-01-02T03:04:05"));
        assert!(rendered.contains("- Author: claude-code\n"));
        assert!(rendered.contains("- Step: implement\n"));
        assert!(rendered.contains("- Summary: did a thing\n"));
        assert!(rendered.contains("line one\nline two"));
        assert!(rendered.ends_with("\n\n---\n"));
    }

    #[test]
    fn omits_summary_line_when_absent() {
        let ts = Utc::now();
        let section = NoteSection {
            turn: 1,
            ts,
            author: "a",
            step: Step::Review,
            decision: Decision::Succeeded,
            summary: None,
            body: "body",
        };
        assert!(!render(&section).contains("- Summary:"));
    }
}
