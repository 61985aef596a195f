//! Managed section editing
//!
//! The managed section is the part of the configuration file the control
//! server is allowed to overwrite. It is located by exact substring match of
//! two sentinel lines and is never parsed as TOML, so hand edits anywhere
//! else in the file survive every update byte for byte.
//!
//! # Layout
//!
//! ```text
//! ###############################################################################
//! #                            INPUT PLUGINS                                    #
//! ###############################################################################
//! # Managed section revision: 42, updated: 2024-05-01T10:00:00Z
//!
//! [[inputs.cpu]]
//!   percpu = true
//!
//! ###############################################################################
//! #                            SERVICE INPUT PLUGINS                            #
//! ###############################################################################
//! ```
//!
//! The line after the start sentinel is the banner's closing border, so it
//! belongs to the header. The section ends at the next line containing the
//! end sentinel, or at end of file.

use crate::sync::candidate::Candidate;
use crate::sync::error::{RejectionReason, SyncError};
use chrono::{SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Telegraf-style input plugin banner
pub const DEFAULT_START_SENTINEL: &str =
    "#                            INPUT PLUGINS                                    #";

/// Full-width separator closing the managed section
pub const DEFAULT_END_SENTINEL: &str =
    "###############################################################################";

/// Prefix of the generated line written above spliced content
pub const STAMP_PREFIX: &str = "# Managed section revision:";

/// Sentinel strings delimiting the managed section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    pub start: String,
    pub end: String,
    /// Treat an end sentinel directly after the start line as the banner border
    pub skip_border: bool,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_SENTINEL.to_string(),
            end: DEFAULT_END_SENTINEL.to_string(),
            skip_border: true,
        }
    }
}

/// Reads and rewrites the managed section of a configuration file.
///
/// Callers only depend on this trait, so the sentinel surgery below can be
/// swapped for a structural editor without touching the sync cycle.
pub trait SectionEditor: Send + Sync {
    /// Call `visit` with every line of the managed section, without line
    /// terminators and without the generated stamp line. Visits nothing when
    /// the file has no managed section.
    fn visit_section(&self, path: &Path, visit: &mut dyn FnMut(&str)) -> Result<(), SyncError>;

    /// Write a candidate copy of `path` whose managed section holds `content`.
    /// The file at `path` is not modified.
    fn splice(&self, path: &Path, content: &str, revision: &str) -> Result<Candidate, SyncError>;

    /// Refuse content that would not read back as the same section once
    /// spliced, such as a line that would be taken for a sentinel
    fn check_content(&self, content: &str) -> Result<(), RejectionReason>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRole {
    Prefix,
    Start,
    Border,
    Body,
    Suffix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    BeforeStart,
    AfterStart,
    InBody,
    AfterEnd,
}

/// Line classifier shared by extraction and splicing
struct SectionScanner<'a> {
    sentinels: &'a Sentinels,
    state: ScanState,
}

impl<'a> SectionScanner<'a> {
    fn new(sentinels: &'a Sentinels) -> Self {
        Self {
            sentinels,
            state: ScanState::BeforeStart,
        }
    }

    fn classify(&mut self, line: &str) -> LineRole {
        match self.state {
            ScanState::BeforeStart => {
                if line.contains(&self.sentinels.start) {
                    self.state = ScanState::AfterStart;
                    LineRole::Start
                } else {
                    LineRole::Prefix
                }
            }
            ScanState::AfterStart => {
                if line.contains(&self.sentinels.end) {
                    if self.sentinels.skip_border {
                        self.state = ScanState::InBody;
                        LineRole::Border
                    } else {
                        self.state = ScanState::AfterEnd;
                        LineRole::Suffix
                    }
                } else {
                    self.state = ScanState::InBody;
                    LineRole::Body
                }
            }
            ScanState::InBody => {
                if line.contains(&self.sentinels.end) {
                    self.state = ScanState::AfterEnd;
                    LineRole::Suffix
                } else {
                    LineRole::Body
                }
            }
            ScanState::AfterEnd => LineRole::Suffix,
        }
    }

    fn found_start(&self) -> bool {
        self.state != ScanState::BeforeStart
    }
}

/// Strip `\n` or `\r\n` from a raw line
fn trim_eol(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn eol_of(raw: &[u8]) -> &'static str {
    if raw.ends_with(b"\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Sentinel-line implementation of [`SectionEditor`]
#[derive(Debug, Clone, Default)]
pub struct SentinelEditor {
    sentinels: Sentinels,
}

impl SentinelEditor {
    pub fn new(sentinels: Sentinels) -> Self {
        Self { sentinels }
    }

    pub fn sentinels(&self) -> &Sentinels {
        &self.sentinels
    }

    fn stamp(revision: &str) -> String {
        format!(
            "{} {}, updated: {}",
            STAMP_PREFIX,
            revision,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Stamp, blank line, content and blank separator
    fn write_block<W: Write>(
        out: &mut W,
        content: &str,
        revision: &str,
        eol: &str,
    ) -> std::io::Result<()> {
        write!(out, "{}{}{}", Self::stamp(revision), eol, eol)?;
        for line in content.lines() {
            write!(out, "{}{}", line, eol)?;
        }
        out.write_all(eol.as_bytes())
    }

    fn splice_into<R: BufRead, W: Write>(
        &self,
        reader: &mut R,
        out: &mut W,
        content: &str,
        revision: &str,
    ) -> std::io::Result<()> {
        let mut scanner = SectionScanner::new(&self.sentinels);
        let mut raw = Vec::new();
        let mut eol = "\n";
        let mut emitted = false;
        let mut ends_with_newline = true;
        let mut saw_any = false;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            saw_any = true;
            let text = String::from_utf8_lossy(&raw);

            match scanner.classify(&text) {
                LineRole::Prefix | LineRole::Border => out.write_all(&raw)?,
                LineRole::Start => {
                    eol = eol_of(&raw);
                    out.write_all(&raw)?;
                }
                LineRole::Body => {
                    // Old section content is dropped, the new block goes where it started
                    if !emitted {
                        if !ends_with_newline {
                            out.write_all(eol.as_bytes())?;
                        }
                        Self::write_block(out, content, revision, eol)?;
                        emitted = true;
                    }
                    continue;
                }
                LineRole::Suffix => {
                    if !emitted {
                        if !ends_with_newline {
                            out.write_all(eol.as_bytes())?;
                        }
                        Self::write_block(out, content, revision, eol)?;
                        emitted = true;
                    }
                    out.write_all(&raw)?;
                }
            }
            ends_with_newline = raw.ends_with(b"\n");
        }

        if scanner.found_start() {
            if !emitted {
                if !ends_with_newline {
                    out.write_all(eol.as_bytes())?;
                }
                Self::write_block(out, content, revision, eol)?;
            }
            return Ok(());
        }

        // No managed section yet: append a complete one
        if saw_any {
            if !ends_with_newline {
                out.write_all(eol.as_bytes())?;
            }
            out.write_all(eol.as_bytes())?;
        }
        if self.sentinels.skip_border {
            write!(out, "{}{}", self.sentinels.end, eol)?;
        }
        write!(out, "{}{}", self.sentinels.start, eol)?;
        if self.sentinels.skip_border {
            write!(out, "{}{}", self.sentinels.end, eol)?;
        }
        Self::write_block(out, content, revision, eol)?;
        write!(out, "{}{}", self.sentinels.end, eol)
    }
}

impl SectionEditor for SentinelEditor {
    fn visit_section(&self, path: &Path, visit: &mut dyn FnMut(&str)) -> Result<(), SyncError> {
        let file = File::open(path).map_err(|e| SyncError::io("failed to open", path, e))?;
        let mut reader = BufReader::new(file);
        let mut scanner = SectionScanner::new(&self.sentinels);
        let mut raw = Vec::new();
        let mut first_body_line = true;

        loop {
            raw.clear();
            let read = reader
                .read_until(b'\n', &mut raw)
                .map_err(|e| SyncError::io("failed to read", path, e))?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&raw);
            match scanner.classify(&text) {
                LineRole::Body => {
                    let line = trim_eol(&text);
                    let is_stamp = first_body_line && line.starts_with(STAMP_PREFIX);
                    first_body_line = false;
                    if !is_stamp {
                        visit(line);
                    }
                }
                LineRole::Suffix => break,
                _ => {}
            }
        }

        Ok(())
    }

    fn splice(&self, path: &Path, content: &str, revision: &str) -> Result<Candidate, SyncError> {
        let input = File::open(path).map_err(|e| SyncError::io("failed to open", path, e))?;
        let candidate = Candidate::for_active(path);

        let output = File::create(candidate.path())
            .map_err(|e| SyncError::io("failed to create candidate", candidate.path(), e))?;
        let mut writer = BufWriter::new(output);

        self.splice_into(&mut BufReader::new(input), &mut writer, content, revision)
            .and_then(|_| writer.flush())
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|e| SyncError::io("failed to write candidate", candidate.path(), e))?;

        let permissions = fs::metadata(path)
            .map_err(|e| SyncError::io("failed to stat", path, e))?
            .permissions();
        fs::set_permissions(candidate.path(), permissions)
            .map_err(|e| SyncError::io("failed to set permissions on", candidate.path(), e))?;

        Ok(candidate)
    }

    fn check_content(&self, content: &str) -> Result<(), RejectionReason> {
        for (number, line) in content.lines().enumerate() {
            let which = if line.contains(&self.sentinels.end) {
                "end"
            } else if line.contains(&self.sentinels.start) {
                "start"
            } else {
                continue;
            };
            return Err(RejectionReason(format!(
                "line {} of the offered section contains the {} sentinel",
                number + 1,
                which
            )));
        }
        Ok(())
    }
}
