//! Measurement session
//!
//! One session is one run on the system under test: a ranging phase that
//! finds the analyzer range, then optionally a testing phase measured on that
//! range. A session is owned by the connection that created it and holds the
//! instrument lease until it finishes or the connection drops.
//!
//! ## Output layout
//!
//! ```text
//! <out_dir>/<id>_ranging/spl.txt
//! <out_dir>/<id>_ranging/ranging_logs.zip
//! <out_dir>/<id>_ranging/loadgen/...
//! <out_dir>/<id>_testing/...
//! <out_dir>/<id>_session.json
//! ```

pub mod manifest;
pub mod state;

pub use manifest::{PhaseRecord, SessionManifest};
pub use state::{Phase, SessionState};

use crate::bundle;
use crate::calibration::{CalibrationRecord, CalibrationStore};
use crate::config::{is_valid_label, ServerSettings};
use crate::error::{AppResult, DirectorError};
use crate::instrument::{
    log_slice, InstrumentError, InstrumentHandle, InstrumentLease, Range, RangingMode,
};
use crate::protocol::{ProtocolError, RequestedRange};
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Server-wide settings every session needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub out_dir: PathBuf,
    /// The daemon's continuously appended sample log
    pub raw_log: PathBuf,
    pub ranging_mode: RangingMode,
    pub device_type: u32,
    pub correction_factor: f64,
    pub calibration: CalibrationStore,
    /// Leave the daemon running after `done`
    pub keep_daemon: bool,
}

impl SessionContext {
    pub fn from_settings(settings: &ServerSettings, calibration: CalibrationStore) -> Self {
        Self {
            out_dir: settings.server.out_dir.clone(),
            raw_log: settings.ptd.log_file.clone(),
            ranging_mode: settings.server.ranging_mode,
            device_type: settings.ptd.device_type,
            correction_factor: settings.server.correction_factor,
            calibration,
            keep_daemon: settings.server.keep_daemon_between_sessions,
        }
    }
}

/// Session id: local timestamp, then `_<label>` unless the label is empty.
pub fn session_id(created: DateTime<Local>, label: &str) -> String {
    let stamp = created.format("%Y-%m-%d_%H-%M-%S").to_string();
    if label.is_empty() {
        stamp
    } else {
        format!("{}_{}", stamp, label)
    }
}

/// Artifacts of the last session that reached `done`
#[derive(Debug, Clone)]
pub struct FinishedSession {
    pub id: String,
    pub phase_dirs: Vec<(Phase, PathBuf)>,
    pub manifest: PathBuf,
}

impl FinishedSession {
    /// Map a download name to a file: `<phase>/spl.txt` or `session.json`.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name == "session.json" {
            return Some(self.manifest.clone());
        }
        let (phase, file) = name.split_once('/')?;
        if file != "spl.txt" {
            return None;
        }
        let phase: Phase = phase.parse().ok()?;
        self.phase_dirs
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, dir)| dir.join("spl.txt"))
    }

    /// Remove the session's directories and manifest.
    pub fn remove(&self) -> AppResult<()> {
        for (_, dir) in &self.phase_dirs {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(|e| DirectorError::fs(dir, e))?;
            }
        }
        if self.manifest.exists() {
            fs::remove_file(&self.manifest).map_err(|e| DirectorError::fs(&self.manifest, e))?;
        }
        info!(session = %self.id, "Session output removed");
        Ok(())
    }
}

/// One run in progress
pub struct Session {
    id: String,
    label: String,
    state: SessionState,
    calibration: Option<CalibrationRecord>,
    lease: InstrumentLease,
    ctx: Arc<SessionContext>,
    manifest: SessionManifest,
}

impl Session {
    /// Validate the label, claim the instrument and create the output root.
    ///
    /// Ids have one-second resolution; an id whose output already exists is
    /// refused rather than overwritten.
    pub fn new(
        label: &str,
        client_uuid: Option<String>,
        ctx: Arc<SessionContext>,
        instrument: &InstrumentHandle,
    ) -> AppResult<Self> {
        Self::create(label, client_uuid, ctx, instrument, Local::now())
    }

    fn create(
        label: &str,
        client_uuid: Option<String>,
        ctx: Arc<SessionContext>,
        instrument: &InstrumentHandle,
        created: DateTime<Local>,
    ) -> AppResult<Self> {
        if !is_valid_label(label) {
            return Err(ProtocolError::InvalidLabel(label.to_string()).into());
        }
        let lease = instrument.try_lease()?;

        fs::create_dir_all(&ctx.out_dir).map_err(|e| DirectorError::fs(&ctx.out_dir, e))?;

        let id = session_id(created, label);
        let taken = Phase::ALL
            .into_iter()
            .map(|phase| ctx.out_dir.join(format!("{}_{}", id, phase)))
            .chain(std::iter::once(
                ctx.out_dir.join(format!("{}_session.json", id)),
            ))
            .find(|path| path.exists());
        if let Some(path) = taken {
            warn!(session = %id, path = %path.display(), "Session id already in use");
            return Err(DirectorError::fs(
                &path,
                io::Error::new(io::ErrorKind::AlreadyExists, "session id already in use"),
            ));
        }

        let manifest = SessionManifest::new(&id, label, client_uuid, created);
        info!(session = %id, "Session created");

        Ok(Self {
            id,
            label: label.to_string(),
            state: SessionState::Idle,
            calibration: None,
            lease,
            ctx,
            manifest,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn calibration(&self) -> Option<CalibrationRecord> {
        self.calibration
    }

    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    pub fn phase_dir(&self, phase: Phase) -> PathBuf {
        self.ctx.out_dir.join(format!("{}_{}", self.id, phase))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.ctx.out_dir.join(format!("{}_session.json", self.id))
    }

    /// Mark carried by every sample of `phase`
    pub fn marker(&self, phase: Phase) -> String {
        format!("{}_{}", self.id, phase)
    }

    /// Set the phase's range and start sampling.
    pub async fn start(&mut self, phase: Phase, requested: Option<RequestedRange>) -> AppResult<()> {
        self.state.check_start(phase, requested.is_some())?;
        let range = self.range_for(phase, requested)?;

        let dir = self.phase_dir(phase);
        fs::create_dir_all(&dir).map_err(|e| DirectorError::fs(&dir, e))?;

        let marker = self.marker(phase);
        let outcome = start_sampling(&mut self.lease, &range, &marker).await;
        let identity = discard_on_fault(&mut self.lease, outcome).await?;
        if self.manifest.analyzer.is_none() {
            self.manifest.analyzer = Some(identity);
        }

        self.state = SessionState::Running(phase);
        self.manifest.phases.push(PhaseRecord {
            phase,
            range: range.to_string(),
            started: Local::now(),
            stopped: None,
            samples: None,
            upload: None,
        });
        info!(session = %self.id, %phase, %range, "Phase started");
        Ok(())
    }

    fn range_for(&self, phase: Phase, requested: Option<RequestedRange>) -> AppResult<Range> {
        let range = match (phase, requested) {
            (Phase::Ranging, _) => Range::for_ranging(self.ctx.ranging_mode, self.ctx.device_type),
            (Phase::Testing, Some(RequestedRange::Auto)) => Range::AUTO,
            (Phase::Testing, Some(RequestedRange::Explicit { volts, amps })) => {
                Range::explicit(volts, amps)
            }
            (Phase::Testing, None) => self
                .calibration
                .ok_or(ProtocolError::NoCalibration)?
                .testing_range(self.ctx.correction_factor),
        };
        Ok(range)
    }

    /// Stop sampling and cut the phase's samples out of the raw log.
    ///
    /// Once the daemon acknowledged the stop the phase counts as stopped,
    /// even if no samples carry its marker.
    pub async fn stop(&mut self, phase: Phase) -> AppResult<()> {
        self.state.check_stop(phase)?;
        let outcome = match self.lease.analyzer().await {
            Ok(analyzer) => analyzer.stop().await,
            Err(e) => Err(e),
        };
        discard_on_fault(&mut self.lease, outcome).await?;
        self.state = SessionState::Stopped(phase);

        let spl = self.phase_dir(phase).join("spl.txt");
        let samples = extract_samples(&self.id, phase, &self.ctx.raw_log, &spl).await;
        if let Some(record) = self.manifest.phase_mut(phase) {
            record.stopped = Some(Local::now());
            record.samples = samples;
        }
        info!(session = %self.id, %phase, samples = ?samples, "Phase stopped");

        if phase == Phase::Ranging {
            self.calibration = derive_calibration(&self.id, &self.label, &self.ctx, &spl).await;
            self.manifest.calibration = self.calibration;
        }
        Ok(())
    }

    /// Where an upload for `phase` is stored, if uploads are allowed now.
    pub fn upload_target(&self, phase: Phase) -> AppResult<PathBuf> {
        self.state.check_upload(phase)?;
        Ok(self.phase_dir(phase).join(format!("{}_logs.zip", phase)))
    }

    /// Unpack a received upload into the phase's `loadgen` directory.
    pub async fn store_upload(&mut self, phase: Phase, archive: &Path) -> AppResult<()> {
        let dest = self.phase_dir(phase).join("loadgen");
        let zip = archive.to_path_buf();
        let target = dest.clone();
        let files = tokio::task::spawn_blocking(move || bundle::extract_zip(&zip, &target))
            .await
            .map_err(|e| DirectorError::fs(&dest, std::io::Error::other(e)))?
            .map_err(|e| DirectorError::fs(&dest, e))?;

        let relative = archive
            .strip_prefix(&self.ctx.out_dir)
            .unwrap_or(archive)
            .display()
            .to_string();
        if let Some(record) = self.manifest.phase_mut(phase) {
            record.upload = Some(relative);
        }
        info!(session = %self.id, %phase, files, "Workload logs stored");
        Ok(())
    }

    /// Finish the run: write the manifest and, unless configured to keep
    /// it, release the instrument.
    pub async fn done(&mut self) -> AppResult<FinishedSession> {
        self.state.check_done()?;
        self.state = SessionState::Done;

        self.manifest.finished = Some(Local::now());
        if let Some(analyzer) = self.lease.active() {
            self.manifest.daemon_messages = analyzer.messages();
        }
        let manifest = self.manifest_path();
        self.manifest.write(&manifest)?;

        if !self.ctx.keep_daemon {
            self.lease.release().await;
        }

        let phase_dirs = Phase::ALL
            .into_iter()
            .map(|phase| (phase, self.phase_dir(phase)))
            .filter(|(_, dir)| dir.exists())
            .collect();
        info!(session = %self.id, "Session done");
        Ok(FinishedSession {
            id: self.id.clone(),
            phase_dirs,
            manifest,
        })
    }

    /// Tear down after the connection was lost. Never resumes.
    ///
    /// The instrument is released like at `done`; a daemon that failed to
    /// answer the stop is discarded instead.
    pub async fn abort(mut self) {
        let mut faulted = false;
        if let Some(phase) = self.state.running_phase() {
            warn!(session = %self.id, %phase, "Connection lost mid-phase, stopping analyzer");
            if let Some(analyzer) = self.lease.active() {
                if let Err(e) = analyzer.stop().await {
                    warn!(session = %self.id, error = %e, "Failed to stop analyzer");
                    faulted = e.is_fault();
                }
            }
        }
        if faulted {
            self.lease.discard().await;
        } else if !self.ctx.keep_daemon {
            self.lease.release().await;
        }
        if self.state != SessionState::Done {
            self.manifest.aborted = true;
            self.manifest.finished = Some(Local::now());
            if let Err(e) = self.manifest.write(&self.manifest_path()) {
                warn!(session = %self.id, error = %e, "Failed to write manifest");
            }
            info!(session = %self.id, state = %self.state, "Session aborted");
        }
    }
}

async fn start_sampling(
    lease: &mut InstrumentLease,
    range: &Range,
    marker: &str,
) -> Result<String, InstrumentError> {
    let analyzer = lease.analyzer().await?;
    analyzer.set_range(range).await?;
    analyzer.start_logging(marker).await?;
    Ok(analyzer.identity().to_string())
}

/// Pass `outcome` through, dropping the analyzer first when it failed with
/// a transport or daemon fault so the next command relaunches it.
async fn discard_on_fault<T>(
    lease: &mut InstrumentLease,
    outcome: Result<T, InstrumentError>,
) -> Result<T, InstrumentError> {
    if let Err(e) = &outcome {
        if e.is_fault() {
            lease.discard().await;
        }
    }
    outcome
}

async fn extract_samples(id: &str, phase: Phase, raw_log: &Path, spl: &Path) -> Option<usize> {
    let raw_log = raw_log.to_path_buf();
    let marker = format!("{}_{}", id, phase);
    let dest = spl.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        log_slice::extract_marked(&raw_log, &marker, &dest)
    })
    .await;

    match result {
        Ok(Ok(0)) => {
            warn!(session = %id, %phase, "No samples carry the phase marker");
            Some(0)
        }
        Ok(Ok(count)) => Some(count),
        Ok(Err(e)) => {
            warn!(session = %id, %phase, error = %e, "Could not extract samples");
            None
        }
        Err(e) => {
            warn!(session = %id, %phase, error = %e, "Sample extraction panicked");
            None
        }
    }
}

async fn derive_calibration(
    id: &str,
    label: &str,
    ctx: &SessionContext,
    spl: &Path,
) -> Option<CalibrationRecord> {
    if let Some(record) = ctx.calibration.get(label) {
        info!(session = %id, ?record, "Using calibration file entry");
        return Some(record);
    }

    let path = spl.to_path_buf();
    let scanned = tokio::task::spawn_blocking(move || log_slice::scan_maxima(&path)).await;
    match scanned {
        Ok(Ok(Some(record))) => {
            info!(session = %id, ?record, "Calibration derived from ranging samples");
            Some(record)
        }
        Ok(Ok(None)) => {
            warn!(session = %id, "Ranging produced no usable samples, no calibration");
            None
        }
        Ok(Err(e)) => {
            warn!(session = %id, error = %e, "Could not read ranging samples");
            None
        }
        Err(e) => {
            warn!(session = %id, error = %e, "Calibration scan panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::instrument::{AnalyzerSettings, MockLauncher};
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        adapter: MockAdapter,
        launcher: Arc<MockLauncher>,
        instrument: InstrumentHandle,
        ctx: Arc<SessionContext>,
    }

    fn fixture(calibration: CalibrationStore) -> Fixture {
        let dir = TempDir::new().unwrap();
        let adapter = MockAdapter::new();
        let settings = AnalyzerSettings {
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        let launcher = Arc::new(MockLauncher::new(adapter.clone(), settings));
        let instrument = InstrumentHandle::new(launcher.clone());
        let ctx = Arc::new(SessionContext {
            out_dir: dir.path().join("out"),
            raw_log: dir.path().join("ptd_logfile.log"),
            ranging_mode: RangingMode::Auto,
            device_type: 49,
            correction_factor: 1.1,
            calibration,
            keep_daemon: false,
        });
        Fixture {
            _dir: dir,
            adapter,
            launcher,
            instrument,
            ctx,
        }
    }

    fn append_samples(ctx: &SessionContext, marker: &str, samples: &[(f64, f64)]) {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.raw_log)
            .unwrap();
        for (volts, amps) in samples {
            writeln!(
                file,
                "Time,10-05-2024 12:00:01.000,Watts,100,Volts,{},Amps,{},PF,1,Mark,{}",
                volts, amps, marker
            )
            .unwrap();
        }
    }

    #[test]
    fn test_session_id_format() {
        let created = Local.with_ymd_and_hms(2024, 5, 10, 12, 0, 3).unwrap();
        assert_eq!(session_id(created, "run"), "2024-05-10_12-00-03_run");
        assert_eq!(session_id(created, ""), "2024-05-10_12-00-03");
    }

    #[tokio::test]
    async fn test_invalid_label_rejected() {
        let f = fixture(CalibrationStore::empty());
        let result = Session::new("a b", None, f.ctx.clone(), &f.instrument);
        assert!(matches!(
            result,
            Err(DirectorError::Protocol(ProtocolError::InvalidLabel(_)))
        ));
        assert!(!f.instrument.is_leased());
    }

    #[tokio::test]
    async fn test_second_session_is_busy() {
        let f = fixture(CalibrationStore::empty());
        let _first = Session::new("a", None, f.ctx.clone(), &f.instrument).unwrap();
        assert!(Session::new("b", None, f.ctx.clone(), &f.instrument).is_err());
    }

    #[tokio::test]
    async fn test_full_run_uses_scaled_calibration() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();

        session.start(Phase::Ranging, None).await.unwrap();
        append_samples(&f.ctx, &session.marker(Phase::Ranging), &[(229.0, 4.0), (230.0, 5.0)]);
        session.stop(Phase::Ranging).await.unwrap();
        assert_eq!(
            session.calibration(),
            Some(CalibrationRecord {
                max_amps: 5.0,
                max_volts: 230.0
            })
        );

        f.adapter.clear_log();
        session.start(Phase::Testing, None).await.unwrap();
        let log = f.adapter.call_log();
        assert_eq!(&log[..2], &["SR,V,253", "SR,A,5.5"]);
        assert_eq!(log[2], format!("Go,1000,0,{}_testing", session.id()));

        session.stop(Phase::Testing).await.unwrap();
        let finished = session.done().await.unwrap();
        assert_eq!(finished.phase_dirs.len(), 2);
        assert!(finished.manifest.exists());
        assert!(finished.resolve("ranging/spl.txt").unwrap().exists());
        assert!(finished.resolve("../etc/passwd").is_none());
        assert!(f.adapter.call_log().contains(&"disconnect".to_string()));

        drop(session);
        assert!(!f.instrument.is_leased());
    }

    #[tokio::test]
    async fn test_calibration_file_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cal.json");
        fs::write(&path, r#"{"run": {"maxAmps": 2.0, "maxVolts": 100.0}}"#).unwrap();
        let f = fixture(CalibrationStore::load(&path).unwrap());

        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();
        session.stop(Phase::Ranging).await.unwrap();
        assert_eq!(session.calibration().unwrap().max_amps, 2.0);
    }

    #[tokio::test]
    async fn test_testing_without_calibration_is_rejected() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();
        session.stop(Phase::Ranging).await.unwrap();

        let err = session.start(Phase::Testing, None).await.unwrap_err();
        assert!(matches!(
            err,
            DirectorError::Protocol(ProtocolError::NoCalibration)
        ));
        assert_eq!(session.state(), SessionState::Stopped(Phase::Ranging));

        session
            .start(Phase::Testing, Some(RequestedRange::Auto))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Running(Phase::Testing));
    }

    #[tokio::test]
    async fn test_instrument_failure_keeps_state() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();

        f.adapter.set_reply("Stop", "Error: device busy");
        assert!(session.stop(Phase::Ranging).await.is_err());
        assert_eq!(session.state(), SessionState::Running(Phase::Ranging));
        assert!(!session.phase_dir(Phase::Ranging).join("spl.txt").exists());
    }

    #[tokio::test]
    async fn test_abort_mid_phase_stops_analyzer_and_frees_lease() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();
        let spl = session.phase_dir(Phase::Ranging).join("spl.txt");

        f.adapter.clear_log();
        session.abort().await;
        let log = f.adapter.call_log();
        assert_eq!(log.first().map(String::as_str), Some("Stop"));
        assert_eq!(log.last().map(String::as_str), Some("disconnect"));
        assert!(!f.instrument.is_leased());
        assert!(!spl.exists());
    }

    #[tokio::test]
    async fn test_fault_discards_analyzer_and_next_session_relaunches() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("crash", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();

        f.adapter.inject_next_failure();
        let err = session.stop(Phase::Ranging).await.unwrap_err();
        assert!(matches!(err, DirectorError::Instrument(ref e) if e.is_fault()));
        assert_eq!(session.state(), SessionState::Running(Phase::Ranging));
        assert_eq!(f.adapter.call_log().last().map(String::as_str), Some("disconnect"));

        f.adapter.clear_log();
        session.abort().await;
        // nothing left to stop once the analyzer was discarded
        assert!(!f.adapter.call_log().contains(&"Stop".to_string()));

        let mut next = Session::new("after", None, f.ctx.clone(), &f.instrument).unwrap();
        next.start(Phase::Ranging, None).await.unwrap();
        next.stop(Phase::Ranging).await.unwrap();
        assert_eq!(f.launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_rejected_command_keeps_analyzer() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("run", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();

        f.adapter.set_reply("Stop", "Error: device busy");
        assert!(session.stop(Phase::Ranging).await.is_err());
        assert!(!f.adapter.call_log().contains(&"disconnect".to_string()));
        f.adapter.set_reply("Stop", "Stopping untimed measurement");
        session.stop(Phase::Ranging).await.unwrap();
        assert_eq!(f.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_same_second_id_is_refused() {
        let f = fixture(CalibrationStore::empty());
        let created = Local.with_ymd_and_hms(2024, 5, 10, 12, 0, 3).unwrap();

        let mut first =
            Session::create("dup", None, f.ctx.clone(), &f.instrument, created).unwrap();
        first.start(Phase::Ranging, None).await.unwrap();
        append_samples(&f.ctx, &first.marker(Phase::Ranging), &[(230.0, 5.0)]);
        first.stop(Phase::Ranging).await.unwrap();
        let finished = first.done().await.unwrap();
        drop(first);
        let spl = finished.resolve("ranging/spl.txt").unwrap();
        let before = fs::read_to_string(&spl).unwrap();

        let err = Session::create("dup", None, f.ctx.clone(), &f.instrument, created)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DirectorError::Filesystem { ref source, .. }
                if source.kind() == io::ErrorKind::AlreadyExists
        ));
        assert!(!f.instrument.is_leased());
        assert_eq!(fs::read_to_string(&spl).unwrap(), before);

        let other = Session::create("other", None, f.ctx.clone(), &f.instrument, created);
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_ranging_only_run_can_finish() {
        let f = fixture(CalibrationStore::empty());
        let mut session = Session::new("", None, f.ctx.clone(), &f.instrument).unwrap();
        session.start(Phase::Ranging, None).await.unwrap();
        session.stop(Phase::Ranging).await.unwrap();
        let finished = session.done().await.unwrap();
        assert_eq!(finished.phase_dirs.len(), 1);
        assert!(finished.resolve("testing/spl.txt").is_none());
    }
}
