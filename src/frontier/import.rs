use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frontier::WorkQueueFrontier;
use crate::journal::{self, JournalTag};
use crate::uri::{CrawlUri, SchedulingDirective};

const PROGRESS_INTERVAL: u64 = 1_000_000;

/// Decides whether an imported URI is still wanted.
pub trait Scope: Send + Sync {
    fn accepts(&self, curi: &CrawlUri) -> bool;
}

impl<F> Scope for F
where
    F: Fn(&CrawlUri) -> bool + Send + Sync,
{
    fn accepts(&self, curi: &CrawlUri) -> bool {
        self(curi)
    }
}

/// Options for [`WorkQueueFrontier::import_uris`], in the camelCase JSON
/// form operators submit. Every flag defaults to off.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportParams {
    /// `recoveryLog`, `crawlLog`, or anything else for a plain URI list.
    pub format: String,
    pub path: PathBuf,
    pub force_revisit: bool,
    pub as_seeds: bool,
    pub scope_scheduleds: bool,
    pub include_successes: bool,
    pub include_failures: bool,
    pub include_scheduleds: bool,
    pub schedule_successes: bool,
    pub schedule_failures: bool,
    pub schedule_scheduleds: bool,
    pub scope_includes: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub lines: u64,
    pub included: u64,
    /// URIs that got past the uniqueness filter.
    pub scheduled: u64,
    pub bad_lines: u64,
}

impl WorkQueueFrontier {
    /// Import URIs from the file named in `params`. Malformed lines are
    /// logged and skipped.
    pub fn import_uris(&self, params: &ImportParams) -> Result<ImportSummary> {
        log::info!("importing {:?} as {}", params.path, params.format);
        let summary = match params.format.as_str() {
            "recoveryLog" => {
                let mut summary = self.include_from_journal(params)?;
                self.schedule_from_journal(params, &mut summary)?;
                summary
            }
            "crawlLog" => self.import_list(params, 3)?,
            _ => self.import_list(params, 0)?,
        };
        log::info!(
            "imported {:?}: {} lines, {} included, {} scheduled, {} bad",
            params.path,
            summary.lines,
            summary.included,
            summary.scheduled,
            summary.bad_lines
        );
        Ok(summary)
    }

    fn accepted_by_scope(&self, curi: &CrawlUri, check: bool) -> bool {
        match self.scope.as_ref() {
            Some(scope) if check => scope.accepts(curi),
            _ => true,
        }
    }

    /// First pass: mark finished (and optionally added) URIs as seen,
    /// copying their lines into this frontier's journal.
    fn include_from_journal(&self, params: &ImportParams) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let reader = BufReader::new(File::open(&params.path)?);
        for line in reader.lines() {
            let line = line?;
            summary.lines += 1;
            if summary.lines % PROGRESS_INTERVAL == 0 {
                log::info!(
                    "at line {} discovered count = {}",
                    summary.lines,
                    self.discovered_uri_count()
                );
            }
            let wanted = match line_tag(&line) {
                Some(JournalTag::Succeeded) => params.include_successes,
                Some(JournalTag::Failed) => params.include_failures,
                Some(JournalTag::Added) => params.include_scheduleds,
                _ => false,
            };
            if !wanted {
                continue;
            }
            let curi = match journal::parse_line(&line) {
                Ok((_, curi)) => curi,
                Err(e) => {
                    log::warn!("bad journal line {:?}: {}", line, e);
                    summary.bad_lines += 1;
                    continue;
                }
            };
            if !self.accepted_by_scope(&curi, params.scope_includes) {
                continue;
            }
            self.consider_included(curi)?;
            if let Some(journal) = self.journal.as_ref() {
                journal.write_raw(&line)?;
            }
            summary.included += 1;
        }
        Ok(summary)
    }

    /// Second pass: schedule the selected lines. URIs included by the first
    /// pass are dropped as duplicates unless revisits are forced, and are
    /// not counted as scheduled.
    fn schedule_from_journal(&self, params: &ImportParams, summary: &mut ImportSummary) -> Result<()> {
        let reader = BufReader::new(File::open(&params.path)?);
        let queued_at_start = self.queued_uri_count();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let n = n as u64 + 1;
            if n % PROGRESS_INTERVAL == 0 {
                log::info!(
                    "through line {}/{} queued count = {}",
                    n,
                    summary.lines,
                    self.queued_uri_count()
                );
            }
            let wanted = match line_tag(&line) {
                Some(JournalTag::Succeeded) => params.schedule_successes,
                Some(JournalTag::Failed) => params.schedule_failures,
                Some(JournalTag::Added) => params.schedule_scheduleds,
                _ => false,
            };
            if !wanted {
                continue;
            }
            let mut curi = match journal::parse_line(&line) {
                Ok((_, curi)) => curi,
                Err(e) => {
                    log::warn!("bad URI during journal import {:?}: {}", line, e);
                    summary.bad_lines += 1;
                    continue;
                }
            };
            if !self.accepted_by_scope(&curi, params.scope_scheduleds) {
                continue;
            }
            curi.force_fetch = params.force_revisit;
            if self.schedule_if_new(curi)? {
                summary.scheduled += 1;
            }
        }
        log::debug!(
            "journal import queued {} URIs",
            self.queued_uri_count() - queued_at_start
        );
        Ok(())
    }

    /// One URI per line, optionally after `skip` leading whitespace
    /// separated fields. Text after `#` is ignored.
    fn import_list(&self, params: &ImportParams, skip: usize) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let reader = BufReader::new(File::open(&params.path)?);
        for line in reader.lines() {
            let line = line?;
            summary.lines += 1;
            let entry = match line.find('#') {
                Some(at) => &line[..at],
                None => line.as_str(),
            };
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let entry = if skip > 0 {
                let rest: Vec<&str> = entry.split_whitespace().skip(skip).collect();
                if rest.is_empty() {
                    log::warn!("short crawl log line {:?}", line);
                    summary.bad_lines += 1;
                    continue;
                }
                rest.join(" ")
            } else {
                entry.to_owned()
            };
            let mut curi = match CrawlUri::from_hops_via_string(&entry) {
                Ok(curi) => curi,
                Err(e) => {
                    log::warn!("bad import line {:?}: {}", line, e);
                    summary.bad_lines += 1;
                    continue;
                }
            };
            if !self.accepted_by_scope(&curi, params.scope_scheduleds) {
                continue;
            }
            if params.as_seeds {
                curi.is_seed = true;
                curi.scheduling_directive = SchedulingDirective::Medium;
            }
            curi.force_fetch = params.force_revisit;
            if self.schedule_if_new(curi)? {
                summary.scheduled += 1;
            }
        }
        Ok(summary)
    }
}

fn line_tag(line: &str) -> Option<JournalTag> {
    if line.len() < 4 {
        return None;
    }
    line.get(..3).and_then(JournalTag::from_prefix)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::Config;

    fn frontier() -> WorkQueueFrontier {
        WorkQueueFrontier::builder(Config {
            recovery_log_enabled: false,
            ..Config::default()
        })
        .scope(|curi: &CrawlUri| !curi.uri().contains("/private/"))
        .build()
        .unwrap()
    }

    fn write_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn params_parse_from_camel_case() {
        let params: ImportParams = serde_json::from_str(
            r#"{"format":"recoveryLog","path":"/tmp/x","forceRevisit":true,"scopeIncludes":true}"#,
        )
        .unwrap();
        assert_eq!(params.format, "recoveryLog");
        assert!(params.force_revisit);
        assert!(params.scope_includes);
        assert!(!params.include_successes);
    }

    #[test]
    fn plain_list_skips_comments_and_bad_lines() {
        let f = frontier();
        let file = write_file(&[
            "# seeds",
            "http://a.example/",
            "",
            "http://b.example/ L http://a.example/  # found there",
            "not a uri",
        ]);
        let summary = f
            .import_uris(&ImportParams {
                path: file.path().to_owned(),
                as_seeds: true,
                ..ImportParams::default()
            })
            .unwrap();
        assert_eq!(summary.lines, 5);
        assert_eq!(summary.scheduled, 2);
        assert_eq!(summary.bad_lines, 1);
        assert_eq!(f.queued_uri_count(), 2);
    }

    #[test]
    fn imported_seeds_jump_ahead_of_discoveries() {
        let f = frontier();
        f.schedule(CrawlUri::new("http://a.example/found").unwrap()).unwrap();
        let file = write_file(&["http://a.example/seed"]);
        f.import_uris(&ImportParams {
            path: file.path().to_owned(),
            as_seeds: true,
            ..ImportParams::default()
        })
        .unwrap();
        let first = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(first.uri(), "http://a.example/seed");
        assert!(first.is_seed);
        assert_eq!(first.scheduling_directive, SchedulingDirective::Medium);
    }

    #[test]
    fn crawl_log_skips_leading_fields() {
        let f = frontier();
        let file = write_file(&["2024-01-01T00:00:00Z 200 1234 http://a.example/x L http://a.example/"]);
        let summary = f
            .import_uris(&ImportParams {
                format: "crawlLog".into(),
                path: file.path().to_owned(),
                ..ImportParams::default()
            })
            .unwrap();
        assert_eq!(summary.scheduled, 1);
        let curi = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(curi.uri(), "http://a.example/x");
        assert_eq!(curi.path_from_seed, "L");
    }

    #[test]
    fn recovery_log_includes_then_schedules() {
        let f = frontier();
        let file = write_file(&[
            "F+ http://a.example/done",
            "F+ http://a.example/todo L http://a.example/",
            "F+ http://a.example/private/x",
            "Fs http://a.example/done",
            "Fe http://a.example/done",
            "F+",
        ]);
        let summary = f
            .import_uris(&ImportParams {
                format: "recoveryLog".into(),
                path: file.path().to_owned(),
                include_successes: true,
                schedule_scheduleds: true,
                scope_scheduleds: true,
                ..ImportParams::default()
            })
            .unwrap();
        assert_eq!(summary.lines, 6);
        assert_eq!(summary.included, 1);
        // done is already included, private is out of scope
        assert_eq!(summary.scheduled, 1);
        assert_eq!(f.queued_uri_count(), 1);
        let curi = f.find_eligible_uri().unwrap().unwrap();
        assert_eq!(curi.uri(), "http://a.example/todo");
    }
}
