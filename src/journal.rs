//! Append-only recovery journal.
//!
//! One event per line: a three character tag (two letters and a space)
//! followed by the URI. Additions and final dispositions also carry the hop
//! path and via, so a replay can rebuild pending work with its provenance.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{FrontierError, Result};
use crate::uri::CrawlUri;

pub const JOURNAL_FILENAME: &str = "frontier.recover.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalTag {
    Added,
    Emitted,
    Included,
    Disregarded,
    Rescheduled,
    Succeeded,
    Failed,
}

impl JournalTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalTag::Added => "F+ ",
            JournalTag::Emitted => "Fe ",
            JournalTag::Included => "Fi ",
            JournalTag::Disregarded => "Fd ",
            JournalTag::Rescheduled => "Fr ",
            JournalTag::Succeeded => "Fs ",
            JournalTag::Failed => "Ff ",
        }
    }

    pub(crate) fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "F+ " => JournalTag::Added,
            "Fe " => JournalTag::Emitted,
            "Fi " => JournalTag::Included,
            "Fd " => JournalTag::Disregarded,
            "Fr " => JournalTag::Rescheduled,
            "Fs " => JournalTag::Succeeded,
            "Ff " => JournalTag::Failed,
            _ => return None,
        })
    }
}

/// Split a journal line into its tag and the `uri [hops [via]]` payload.
pub fn parse_line(line: &str) -> Result<(JournalTag, CrawlUri)> {
    let tag = line
        .get(..3)
        .and_then(JournalTag::from_prefix)
        .ok_or_else(|| FrontierError::Journal(line.to_owned()))?;
    let curi = CrawlUri::from_hops_via_string(&line[3..])?;
    Ok((tag, curi))
}

pub struct FrontierJournal {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
    lines: AtomicU64,
}

impl FrontierJournal {
    /// Open (appending) the journal file in `dir`, creating both if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(JOURNAL_FILENAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: Mutex::new(BufWriter::new(file)),
            lines: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written since this journal was opened.
    pub fn lines_written(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    fn write(&self, tag: JournalTag, payload: &str) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(tag.as_str().as_bytes())?;
        out.write_all(payload.as_bytes())?;
        out.write_all(b"\n")?;
        self.lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn added(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Added, &curi.hops_via_string())
    }

    pub fn emitted(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Emitted, curi.uri())
    }

    pub fn disregarded(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Disregarded, curi.uri())
    }

    pub fn rescheduled(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Rescheduled, curi.uri())
    }

    pub fn succeeded(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Succeeded, &curi.hops_via_string())
    }

    pub fn failed(&self, curi: &CrawlUri) -> Result<()> {
        self.write(JournalTag::Failed, &curi.hops_via_string())
    }

    /// Copy a line read from an older journal verbatim.
    pub fn write_raw(&self, line: &str) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        self.lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.flush()?;
        Ok(())
    }
}

impl Drop for FrontierJournal {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush journal {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::Hop;

    #[test]
    fn writes_tagged_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = FrontierJournal::open(dir.path()).unwrap();
        let seed = CrawlUri::seed("http://a.example/").unwrap();
        let page = CrawlUri::discovered(&seed, "/p", Hop::Link).unwrap();
        journal.added(&seed).unwrap();
        journal.added(&page).unwrap();
        journal.emitted(&page).unwrap();
        journal.succeeded(&page).unwrap();
        journal.flush().unwrap();
        assert_eq!(journal.lines_written(), 4);

        let text = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "F+ http://a.example/ - -");
        assert_eq!(lines[1], "F+ http://a.example/p L http://a.example/");
        assert_eq!(lines[2], "Fe http://a.example/p");
        assert_eq!(lines[3], "Fs http://a.example/p L http://a.example/");
    }

    #[test]
    fn parses_lines() {
        let (tag, curi) = parse_line("Ff http://a.example/x LL http://a.example/").unwrap();
        assert_eq!(tag, JournalTag::Failed);
        assert_eq!(curi.uri(), "http://a.example/x");
        assert_eq!(curi.path_from_seed, "LL");
        assert!(parse_line("Zz http://a.example/").is_err());
        assert!(parse_line("F+").is_err());
        assert!(parse_line("F+ ::not-a-uri").is_err());
    }
}
