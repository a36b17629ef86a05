use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

const ESC: char = '\u{1b}';
const BEL: char = '\u{7}';
const CSI_8BIT: char = '\u{9b}';

/// Removes terminal escape sequences (CSI, OSC and two-byte ESC forms).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESC => match chars.peek().copied() {
                Some('[') => {
                    chars.next();
                    skip_csi(&mut chars);
                }
                Some(']') => {
                    chars.next();
                    skip_osc(&mut chars);
                }
                // Charset designators carry one extra byte.
                Some('(' | ')' | '*' | '+' | '#' | '%') => {
                    chars.next();
                    chars.next();
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            CSI_8BIT => skip_csi(&mut chars),
            _ => out.push(c),
        }
    }
    out
}

fn skip_csi(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    // Parameter and intermediate bytes run until a final byte in 0x40..=0x7e.
    for c in chars.by_ref() {
        if ('\u{40}'..='\u{7e}').contains(&c) {
            break;
        }
    }
}

fn skip_osc(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while let Some(c) = chars.next() {
        if c == BEL {
            break;
        }
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            break;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Started,
    Eula,
}

/// Finds the trigger whose substring occurs earliest in `chunk`.
pub fn detect_trigger(chunk: &str, started: &str, eula: Option<&str>) -> Option<Trigger> {
    let started_at = (!started.is_empty())
        .then(|| chunk.find(started))
        .flatten();
    let eula_at = eula
        .filter(|e| !e.is_empty())
        .and_then(|e| chunk.find(e));

    match (started_at, eula_at) {
        (Some(s), Some(e)) if e < s => Some(Trigger::Eula),
        (Some(_), _) => Some(Trigger::Started),
        (None, Some(_)) => Some(Trigger::Eula),
        (None, None) => None,
    }
}

pub fn is_blank(chunk: &str) -> bool {
    chunk.chars().all(char::is_whitespace)
}

/// Per-run console log, opened on first write and truncated at open.
#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    run_id: u64,
    file: Option<tokio::fs::File>,
}

impl ConsoleLog {
    pub fn new(path: PathBuf, run_id: u64) -> Self {
        Self {
            path,
            run_id,
            file: None,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_chunk(&mut self, chunk: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .await?;
            self.file = Some(f);
        }

        let Some(f) = self.file.as_mut() else {
            return Ok(());
        };
        let mut line = chunk.replace('\r', "");
        while line.ends_with('\n') {
            line.pop();
        }
        line.push('\n');
        f.write_all(line.as_bytes()).await
    }

    pub async fn close(mut self) {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_cursor_sequences() {
        assert_eq!(strip_ansi("\u{1b}[32;1mDone\u{1b}[0m"), "Done");
        assert_eq!(strip_ansi("a\u{1b}[2Kb"), "ab");
        assert_eq!(strip_ansi("\u{1b}[?25lx"), "x");
    }

    #[test]
    fn strips_osc_titles() {
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text"), "text");
        assert_eq!(strip_ansi("\u{1b}]2;t\u{1b}\\text"), "text");
    }

    #[test]
    fn strips_short_escapes_and_keeps_plain_text() {
        assert_eq!(strip_ansi("\u{1b}(Bplain"), "plain");
        assert_eq!(strip_ansi("\u{1b}=k"), "k");
        assert_eq!(strip_ansi("héllo wörld"), "héllo wörld");
        assert_eq!(strip_ansi("trailing\u{1b}"), "trailing");
    }

    #[test]
    fn started_trigger_matches_substring() {
        let line = "[12:00:00 INFO]: Done (3.2s)! For help, type \"help\"";
        assert_eq!(
            detect_trigger(line, ")! For help, type ", Some("Go to eula.txt for more info.")),
            Some(Trigger::Started)
        );
        assert_eq!(detect_trigger(line, ")! for help", None), None);
    }

    #[test]
    fn earliest_trigger_wins() {
        let both = "Go to eula.txt for more info. then )! For help, type ";
        assert_eq!(
            detect_trigger(both, ")! For help, type ", Some("Go to eula.txt for more info.")),
            Some(Trigger::Eula)
        );
        let reversed = ")! For help, type x Go to eula.txt for more info.";
        assert_eq!(
            detect_trigger(reversed, ")! For help, type ", Some("Go to eula.txt for more info.")),
            Some(Trigger::Started)
        );
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(" \r\n\t"));
        assert!(is_blank(""));
        assert!(!is_blank(" x "));
    }

    #[tokio::test]
    async fn console_log_truncates_on_open_and_normalizes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale\n").unwrap();

        let mut log = ConsoleLog::new(path.clone(), 1);
        log.write_chunk("first\r\n").await.unwrap();
        log.write_chunk("second").await.unwrap();
        log.close().await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
