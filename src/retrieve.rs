//! Retrieval orchestration.
//!
//! One [`Retriever`] serves every request: `check` turns a probe into the
//! user-facing tier menu, `retrieve` drives the full probe → resolve →
//! download → locate sequence. Each retrieval owns a fresh uniquely-suffixed
//! scratch directory; the returned [`Retrieval`] keeps that directory alive
//! exactly as long as the caller needs the file and deletes it on drop, which
//! covers success, failures and mid-stream client disconnects alike.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::engine::{FetchJob, MediaEngine, ProgressSink};
use crate::error::{Error, Result};
use crate::formats::{self, QualityTier};
use crate::quality;
use crate::sanitize::sanitize_title;

pub struct Retriever<E> {
    engine: E,
    scratch_root: PathBuf,
}

/// A finished retrieval. Holds the scratch directory that contains
/// `file_path`; dropping this value deletes the directory and the file, so
/// it must not outlive the response that streams it.
#[derive(Debug)]
pub struct Retrieval {
    title: String,
    file_path: PathBuf,
    size_bytes: u64,
    _scratch: TempDir,
}

impl Retrieval {
    /// Canonical title as reported by the engine probe, unsanitized.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Sanitized file name (token plus extension), suitable for a
    /// `Content-Disposition` header.
    pub fn file_name(&self) -> &str {
        self.file_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("download")
    }
}

impl<E: MediaEngine> Retriever<E> {
    pub fn new(engine: E, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            scratch_root: scratch_root.into(),
        }
    }

    /// Probes the source and collapses the raw format list into the tier
    /// menu served by `/check`.
    pub fn check(&self, url: &str) -> Result<Vec<QualityTier>> {
        let report = self.engine.probe(url)?;
        debug!(formats = report.formats.len(), "probe completed");
        formats::build_tier_menu(&report.formats)
    }

    /// Runs one full retrieval. The quality label is resolved before any
    /// engine work so a malformed label never costs a probe; the probe then
    /// supplies the title that names the scratch output. The progress sink
    /// is best-effort and may be absent.
    pub fn retrieve(
        &self,
        url: &str,
        quality_label: &str,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<Retrieval> {
        let resolved = quality::resolve(quality_label)?;

        let report = self.engine.probe(url)?;
        let token = sanitize_title(&report.title);

        fs::create_dir_all(&self.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{token}."))
            .tempdir_in(&self.scratch_root)?;

        let output_template = scratch
            .path()
            .join(format!("{token}.%(ext)s"))
            .to_string_lossy()
            .into_owned();
        let job = FetchJob {
            selection: resolved.selection.clone(),
            post_processing: resolved.post_processing,
            output_template,
        };

        debug!(quality = quality_label, selection = %resolved.selection, "starting download");
        self.engine.fetch(url, &job, sink)?;

        let file_path = scratch.path().join(format!("{token}.{}", resolved.extension));
        if !file_path.exists() {
            return Err(Error::MissingResult);
        }
        let size_bytes = fs::metadata(&file_path)?.len();

        info!(
            title = %report.title,
            size_bytes,
            quality = quality_label,
            "retrieval complete"
        );

        Ok(Retrieval {
            title: report.title,
            file_path,
            size_bytes,
            _scratch: scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ProbeReport, ProgressEvent, ProgressStatus};
    use crate::formats::RawFormat;
    use crate::quality::PostProcessing;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Copy)]
    enum StubBehavior {
        /// Write the request URL as the file body, so concurrent retrievals
        /// can be told apart.
        WriteUrlBytes,
        /// Report success without producing any file.
        WriteNothing,
        FailProbe,
        FailFetch,
    }

    struct StubEngine {
        title: &'static str,
        formats: Vec<RawFormat>,
        behavior: StubBehavior,
    }

    impl StubEngine {
        fn new(title: &'static str, behavior: StubBehavior) -> Self {
            Self {
                title,
                formats: vec![RawFormat {
                    format_id: Some("140".into()),
                    acodec: Some("mp4a.40.2".into()),
                    vcodec: Some("none".into()),
                    resolution: None,
                    ext: Some("m4a".into()),
                }],
                behavior,
            }
        }
    }

    impl MediaEngine for StubEngine {
        fn probe(&self, _url: &str) -> std::result::Result<ProbeReport, EngineError> {
            if matches!(self.behavior, StubBehavior::FailProbe) {
                return Err(EngineError::Failed("ERROR: Video unavailable".into()));
            }
            Ok(ProbeReport {
                title: self.title.to_owned(),
                formats: self.formats.clone(),
            })
        }

        fn fetch(
            &self,
            url: &str,
            job: &FetchJob,
            sink: Option<&dyn ProgressSink>,
        ) -> std::result::Result<(), EngineError> {
            match self.behavior {
                StubBehavior::FailFetch => Err(EngineError::Failed("ERROR: network down".into())),
                StubBehavior::WriteNothing => Ok(()),
                StubBehavior::WriteUrlBytes => {
                    let ext = match job.post_processing {
                        PostProcessing::ExtractMp3 { .. } => "mp3",
                        PostProcessing::ConvertMp4 => "mp4",
                    };
                    let path = job.output_template.replace("%(ext)s", ext);
                    fs::write(&path, url.as_bytes())
                        .map_err(|err| EngineError::Failed(err.to_string()))?;
                    if let Some(sink) = sink {
                        sink.receive(ProgressEvent {
                            status: ProgressStatus::Finished,
                            downloaded_bytes: url.len() as u64,
                            total_bytes: Some(url.len() as u64),
                        });
                    }
                    Ok(())
                }
                StubBehavior::FailProbe => unreachable!("probe already failed"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn receive(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn check_builds_the_menu_from_the_probe() {
        let root = tempdir().unwrap();
        let retriever = Retriever::new(
            StubEngine::new("Sample", StubBehavior::WriteUrlBytes),
            root.path(),
        );
        let menu = retriever.check("https://example.com/watch?v=abc").unwrap();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].label, "mp3");
    }

    #[test]
    fn check_surfaces_an_empty_format_list() {
        let root = tempdir().unwrap();
        let mut engine = StubEngine::new("Sample", StubBehavior::WriteUrlBytes);
        engine.formats.clear();
        let retriever = Retriever::new(engine, root.path());
        assert!(matches!(
            retriever.check("https://example.com/watch?v=abc"),
            Err(Error::NoFormats)
        ));
    }

    #[test]
    fn retrieve_produces_a_named_file_in_private_scratch() {
        let root = tempdir().unwrap();
        let retriever = Retriever::new(
            StubEngine::new("My Clip (Official)", StubBehavior::WriteUrlBytes),
            root.path(),
        );
        let sink = RecordingSink::default();

        let url = "https://example.com/watch?v=abc";
        let retrieval = retriever.retrieve(url, "mp3", Some(&sink)).unwrap();

        assert_eq!(retrieval.title(), "My Clip (Official)");
        assert_eq!(retrieval.file_name(), "My_Clip_Official.mp3");
        assert_eq!(retrieval.size_bytes(), url.len() as u64);
        assert_eq!(fs::read(retrieval.file_path()).unwrap(), url.as_bytes());
        assert!(retrieval.file_path().starts_with(root.path()));

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ProgressStatus::Finished);
    }

    #[test]
    fn dropping_a_retrieval_deletes_its_scratch_directory() {
        let root = tempdir().unwrap();
        let retriever = Retriever::new(
            StubEngine::new("Sample", StubBehavior::WriteUrlBytes),
            root.path(),
        );
        let retrieval = retriever
            .retrieve("https://example.com/watch?v=abc", "720p", None)
            .unwrap();
        let file_path = retrieval.file_path().to_path_buf();
        assert!(file_path.exists());

        drop(retrieval);
        assert!(!file_path.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn a_vanished_result_is_reported_loudly() {
        let root = tempdir().unwrap();
        let retriever = Retriever::new(
            StubEngine::new("Sample", StubBehavior::WriteNothing),
            root.path(),
        );
        let err = retriever
            .retrieve("https://example.com/watch?v=abc", "720p", None)
            .unwrap_err();
        assert!(matches!(err, Error::MissingResult));
        assert_eq!(err.to_string(), "File not found after extraction.");
        // The failed retrieval must not leave scratch behind.
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn a_malformed_quality_never_reaches_the_engine() {
        let root = tempdir().unwrap();
        // FailProbe would turn any probe into an extraction error, so getting
        // InvalidQuality back proves the label was rejected first.
        let retriever = Retriever::new(StubEngine::new("Sample", StubBehavior::FailProbe), root.path());
        let err = retriever
            .retrieve("https://example.com/watch?v=abc", "720", None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuality(ref label) if label == "720"));
    }

    #[test]
    fn engine_failures_map_to_extraction_errors() {
        let root = tempdir().unwrap();
        let retriever = Retriever::new(
            StubEngine::new("Sample", StubBehavior::FailFetch),
            root.path(),
        );
        let err = retriever
            .retrieve("https://example.com/watch?v=abc", "mp3", None)
            .unwrap_err();
        match err {
            Error::Extraction(message) => assert_eq!(message, "ERROR: network down"),
            other => panic!("expected Extraction, got {other:?}"),
        }
    }

    #[test]
    fn identically_titled_retrievals_never_share_scratch() {
        let root = tempdir().unwrap();
        let retriever = Arc::new(Retriever::new(
            StubEngine::new("Same Title", StubBehavior::WriteUrlBytes),
            root.path(),
        ));

        let urls = [
            "https://example.com/watch?v=one",
            "https://example.com/watch?v=two",
            "https://example.com/watch?v=three",
            "https://example.com/watch?v=four",
        ];

        let retrievals: Vec<Retrieval> = std::thread::scope(|scope| {
            let handles: Vec<_> = urls
                .iter()
                .map(|url| {
                    let retriever = Arc::clone(&retriever);
                    scope.spawn(move || retriever.retrieve(url, "mp3", None).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Every retrieval kept its own bytes: nobody overwrote anybody.
        for (url, retrieval) in urls.iter().zip(&retrievals) {
            assert_eq!(fs::read(retrieval.file_path()).unwrap(), url.as_bytes());
            assert_eq!(retrieval.file_name(), "Same_Title.mp3");
        }

        let mut parents: Vec<&Path> = retrievals
            .iter()
            .map(|r| r.file_path().parent().unwrap())
            .collect();
        parents.sort_unstable();
        parents.dedup();
        assert_eq!(parents.len(), urls.len(), "scratch directories must be distinct");
    }
}
