//! File-backed suppression sources
//!
//! One entry per line. Blank lines and lines starting with `#` are ignored.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
    time::Duration,
};

use serde::Deserialize;

use super::{Digest, LoadReport, Scope, SuppressionEngine, SuppressionList, checked_id};
use crate::error::ConfigError;

const fn default_reload_interval_secs() -> u64 {
    300
}

/// What each line of a source file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Raw addresses, hashed on load
    #[default]
    Emails,
    /// 32 character hex digests
    Digests,
}

/// A suppression list kept in a file.
///
/// ```ron
/// (
///     id: "bounces",
///     name: "Hard bounces",
///     scope: global,
///     path: "/var/lib/herald/bounces.txt",
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SuppressionSource {
    pub id: String,

    /// Display name, defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub scope: Scope,

    pub path: PathBuf,

    #[serde(default)]
    pub format: SourceFormat,
}

impl SuppressionSource {
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuppressionConfig {
    #[serde(default)]
    pub sources: Vec<SuppressionSource>,

    /// How often every source is re-read, 0 disables reloading
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl SuppressionConfig {
    #[must_use]
    pub const fn reload_interval(&self) -> Option<Duration> {
        match self.reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn entry(line: &str) -> Option<&str> {
    let line = line.trim();
    (!line.is_empty() && !line.starts_with('#')).then_some(line)
}

/// Stream a source file into a list, hashing line by line. Blocking.
fn read_source(source: &SuppressionSource, id: &str) -> io::Result<(SuppressionList, LoadReport)> {
    let reader = BufReader::new(File::open(&source.path)?);
    let format = source.format;

    let mut failure = None;
    let digests = reader
        .lines()
        .map_while(|line| line.map_err(|err| failure = Some(err)).ok())
        .filter_map(|line| {
            entry(&line).map(|entry| match format {
                SourceFormat::Emails => Digest::of_address(entry),
                SourceFormat::Digests => Digest::from_hex(entry),
            })
        });

    let built = SuppressionList::build(
        id.to_string(),
        source.display_name().to_string(),
        source.scope,
        digests,
    );

    match failure {
        Some(err) => Err(err),
        None => Ok(built),
    }
}

impl SuppressionEngine {
    /// Read a source file and swap it in as one list. The file is read and
    /// hashed on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the id is empty. The
    /// previously loaded list stays in place in that case.
    pub async fn load_source(&self, source: &SuppressionSource) -> Result<LoadReport, ConfigError> {
        let id = checked_id(&source.id)?.to_string();
        let path = source.path.display().to_string();

        let owned = source.clone();
        let (list, report) = tokio::task::spawn_blocking(move || read_source(&owned, &id))
            .await
            .map_err(io::Error::other)
            .and_then(|read| read)
            .map_err(|err| ConfigError::SourceRead { path, source: err })?;

        self.publish(list, report);
        Ok(report)
    }

    /// Load every configured source, logging failures. Returns how many
    /// sources loaded.
    pub async fn load_sources(&self, sources: &[SuppressionSource]) -> usize {
        let mut loaded = 0;
        for source in sources {
            match self.load_source(source).await {
                Ok(_) => loaded += 1,
                Err(err) => tracing::error!(list = %source.id, "{err}"),
            }
        }
        loaded
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use super::*;

    fn source_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_email_source_skips_comments() {
        let file = source_file("# hard bounces\n\nOne@Example.com\n  two@example.com  \n");
        let engine = SuppressionEngine::new();

        let source = SuppressionSource {
            id: "bounces".into(),
            name: None,
            scope: Scope::List,
            path: file.path().to_path_buf(),
            format: SourceFormat::Emails,
        };

        let report = engine.load_source(&source).await.unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 0);
        assert!(engine.is_suppressed("one@example.com", &["bounces"]));
        assert_eq!(engine.lists()[0].name, "bounces");
    }

    #[tokio::test]
    async fn test_load_digest_source() {
        let digest = Digest::of_address("hashed@example.com").unwrap();
        let file = source_file(&format!("{digest}\nnot-a-digest\n"));
        let engine = SuppressionEngine::new();

        let source = SuppressionSource {
            id: "global".into(),
            name: Some("Complaints".into()),
            scope: Scope::Global,
            path: file.path().to_path_buf(),
            format: SourceFormat::Digests,
        };

        let report = engine.load_source(&source).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert!(engine.is_suppressed::<&str>("hashed@example.com", &[]));
    }

    #[tokio::test]
    async fn test_missing_file_keeps_previous_list() {
        let engine = SuppressionEngine::new();
        engine
            .load_list("bounces", "Bounces", Scope::List, ["kept@example.com"])
            .unwrap();

        let source = SuppressionSource {
            id: "bounces".into(),
            name: None,
            scope: Scope::List,
            path: "/nonexistent/herald/bounces.txt".into(),
            format: SourceFormat::Emails,
        };

        let err = engine.load_source(&source).await.unwrap_err();
        assert!(matches!(err, ConfigError::SourceRead { .. }));
        assert!(engine.is_suppressed("kept@example.com", &["bounces"]));
        assert_eq!(engine.load_sources(&[source]).await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_line_fails_whole_load() {
        let mut file = source_file("first@example.com\n");
        file.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        file.write_all(b"last@example.com\n").unwrap();

        let engine = SuppressionEngine::new();
        engine
            .load_list("bounces", "Bounces", Scope::List, ["kept@example.com"])
            .unwrap();

        let source = SuppressionSource {
            id: "bounces".into(),
            name: None,
            scope: Scope::List,
            path: file.path().to_path_buf(),
            format: SourceFormat::Emails,
        };

        let err = engine.load_source(&source).await.unwrap_err();
        assert!(matches!(err, ConfigError::SourceRead { .. }));
        assert!(engine.is_suppressed("kept@example.com", &["bounces"]));
        assert!(!engine.is_suppressed("first@example.com", &["bounces"]));
    }

    #[test]
    fn test_read_source_streams_lines() {
        let contents: String = (0..1_000)
            .map(|i| format!("user{i}@example.com\n# comment\n\n"))
            .collect();
        let file = source_file(&contents);

        let source = SuppressionSource {
            id: "big".into(),
            name: Some("Big".into()),
            scope: Scope::Global,
            path: file.path().to_path_buf(),
            format: SourceFormat::Emails,
        };

        let (list, report) = read_source(&source, "big").unwrap();
        assert_eq!(report.accepted, 1_000);
        assert_eq!(list.len(), 1_000);
        assert_eq!(list.name(), "Big");
    }

    #[tokio::test]
    async fn test_blank_source_id_rejected_before_reading() {
        let engine = SuppressionEngine::new();
        let source = SuppressionSource {
            id: "  ".into(),
            name: None,
            scope: Scope::List,
            path: "/nonexistent/herald/blank.txt".into(),
            format: SourceFormat::Emails,
        };

        assert!(matches!(
            engine.load_source(&source).await,
            Err(ConfigError::EmptyListId)
        ));
    }

    #[test]
    fn test_config_from_ron() {
        let config: SuppressionConfig = ron::from_str(
            r#"(
                sources: [
                    (id: "global", scope: global, path: "/tmp/global.txt", format: digests),
                    (id: "newsletter", path: "/tmp/newsletter.txt"),
                ],
                reload_interval_secs: 0,
            )"#,
        )
        .unwrap();

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].scope, Scope::Global);
        assert_eq!(config.sources[0].format, SourceFormat::Digests);
        assert_eq!(config.sources[1].scope, Scope::List);
        assert_eq!(config.sources[1].format, SourceFormat::Emails);
        assert!(config.reload_interval().is_none());
    }
}
