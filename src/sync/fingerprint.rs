//! Managed section fingerprints
//!
//! A fingerprint is the MD5 digest of the non-blank lines of the managed
//! section, in order, joined with `\n`. Blank lines never contribute, so
//! whitespace-only edits do not look like configuration changes.

use crate::sync::error::SyncError;
use crate::sync::section::SectionEditor;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Hex-encoded MD5 digest of a managed section
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a managed section given as text
    pub fn of_content(content: &str) -> Self {
        let mut builder = FingerprintBuilder::new();
        for line in content.lines() {
            builder.push(line);
        }
        builder.finish()
    }

    /// Fingerprint of an empty (or missing) managed section
    pub fn empty() -> Self {
        FingerprintBuilder::new().finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct FingerprintBuilder {
    context: md5::Context,
    first: bool,
}

impl FingerprintBuilder {
    fn new() -> Self {
        Self {
            context: md5::Context::new(),
            first: true,
        }
    }

    fn push(&mut self, line: &str) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return;
        }
        if !self.first {
            self.context.consume(b"\n");
        }
        self.context.consume(line.as_bytes());
        self.first = false;
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.context.compute()))
    }
}

/// Computes the fingerprint of the managed section of a file
#[derive(Clone)]
pub struct Fingerprinter {
    editor: Arc<dyn SectionEditor>,
}

impl Fingerprinter {
    pub fn new(editor: Arc<dyn SectionEditor>) -> Self {
        Self { editor }
    }

    /// Stream the managed section of `path` into a digest.
    ///
    /// A file without a start sentinel yields [`Fingerprint::empty`], so an
    /// agent that has never been configured can still receive its first
    /// section.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint, SyncError> {
        let mut builder = FingerprintBuilder::new();
        self.editor
            .visit_section(path, &mut |line| builder.push(line))?;
        Ok(builder.finish())
    }
}
