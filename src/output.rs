//! Console and log-file output for supervised processes.
//!
//! Child output is echoed to stdout or stderr with a `[name]` prefix padded to the
//! longest app name. Apps with a `log_file` template also get every line, and
//! every supervisor note, appended to that file.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;

use crate::process::AppEntry;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Formatting state shared by all apps.
pub struct OutputSink {
    raw: bool,
    names: Vec<String>,
    colors: Vec<Option<String>>,
    width: usize,
    logs: Vec<Option<LineWriter<File>>>,
}

impl OutputSink {
    pub fn new(entries: &[AppEntry], raw: bool) -> Self {
        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let width = names.iter().map(|n| n.len() + 2).max().unwrap_or(0);
        Self {
            raw,
            colors: entries.iter().map(|e| e.color.clone()).collect(),
            logs: init_log_writers(entries),
            names,
            width,
        }
    }

    pub fn name(&self, id: usize) -> &str {
        self.names.get(id).map(String::as_str).unwrap_or("process")
    }

    /// Prints a line of child output and appends it to the app's log file.
    pub fn line(&mut self, id: usize, stream: StreamKind, line: &str) {
        self.write_log(id, line);
        self.echo(
            id,
            stream,
            line,
            &mut std::io::stdout().lock(),
            &mut std::io::stderr().lock(),
        );
    }

    // Stderr lines stay on stderr with or without prefixes.
    fn echo(
        &self,
        id: usize,
        stream: StreamKind,
        line: &str,
        stdout: &mut impl Write,
        stderr: &mut impl Write,
    ) {
        let target: &mut dyn Write = match stream {
            StreamKind::Stdout => stdout,
            StreamKind::Stderr => stderr,
        };
        let _ = if self.raw {
            writeln!(target, "{}", line)
        } else {
            writeln!(target, "{}{}", self.format_prefix(id), line)
        };
    }

    /// Appends a supervisor message to the app's log file.
    pub fn note(&mut self, id: usize, text: &str) {
        self.write_log(id, &format!("[warden] {}", text));
    }

    fn format_prefix(&self, id: usize) -> String {
        let prefix = apply_prefix_length(format!("[{}]", self.name(id)), Some(self.width));
        let mut prefix = apply_color(&prefix, self.colors.get(id).and_then(|c| c.as_deref()));
        prefix.push(' ');
        prefix
    }

    fn write_log(&mut self, id: usize, line: &str) {
        if let Some(Some(writer)) = self.logs.get_mut(id) {
            let _ = writeln!(writer, "{}", line);
        }
    }
}

fn init_log_writers(entries: &[AppEntry]) -> Vec<Option<LineWriter<File>>> {
    // Log files are appended to so restarts of warden keep history.
    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            let template = entry.log_file.as_deref()?;
            let path = render_template(template, &entry.name, idx, &log_timestamp());
            if let Some(parent) = Path::new(&path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(LineWriter::new(file)),
                Err(err) => {
                    tracing::warn!(app = %entry.name, path = %path, error = %err, "cannot open log file");
                    None
                }
            }
        })
        .collect()
}

fn log_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs().to_string()
}

fn render_template(template: &str, name: &str, index: usize, time: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{index}", &index.to_string())
        .replace("{time}", time)
}

fn apply_prefix_length(prefix: String, length: Option<usize>) -> String {
    let Some(length) = length else { return prefix };
    let mut out = prefix;
    if out.len() < length {
        out.push_str(&" ".repeat(length - out.len()));
    }
    out
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_replaces_tokens() {
        assert_eq!(
            render_template("logs/{name}-{index}-{time}.log", "gen", 2, "100"),
            "logs/gen-2-100.log"
        );
    }

    #[test]
    fn prefixes_are_padded_to_longest_name() {
        let entries = vec![AppEntry::new("gen", "python"), AppEntry::new("worker", "x")];
        let sink = OutputSink::new(&entries, false);
        assert_eq!(sink.format_prefix(0), "[gen]    ");
        assert_eq!(sink.format_prefix(1), "[worker] ");
        assert_eq!(sink.name(7), "process");
    }

    #[test]
    fn apply_color_wraps_known_colors_only() {
        assert_eq!(apply_color("[a]", Some("cyan")), "\u{1b}[36m[a]\u{1b}[0m");
        assert_eq!(apply_color("[a]", Some("plaid")), "[a]");
        assert_eq!(apply_color("[a]", None), "[a]");
    }

    #[test]
    fn stderr_lines_stay_on_stderr() {
        let entries = vec![AppEntry::new("gen", "python")];
        for raw in [false, true] {
            let sink = OutputSink::new(&entries, raw);
            let (mut out, mut err) = (Vec::new(), Vec::new());
            sink.echo(0, StreamKind::Stderr, "Traceback", &mut out, &mut err);
            sink.echo(0, StreamKind::Stdout, "ready", &mut out, &mut err);
            let (out, err) = (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap());
            if raw {
                assert_eq!((out.as_str(), err.as_str()), ("ready\n", "Traceback\n"));
            } else {
                assert_eq!((out.as_str(), err.as_str()), ("[gen] ready\n", "[gen] Traceback\n"));
            }
        }
    }

    #[test]
    fn log_file_receives_lines_and_notes() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("logs/{name}.log");
        let mut entry = AppEntry::new("gen", "python");
        entry.log_file = Some(template.display().to_string());
        let mut sink = OutputSink::new(&[entry], true);
        sink.line(0, StreamKind::Stdout, "hello");
        sink.note(0, "restarting");
        drop(sink);
        let written = std::fs::read_to_string(dir.path().join("logs/gen.log")).unwrap();
        assert_eq!(written, "hello\n[warden] restarting\n");
    }
}
