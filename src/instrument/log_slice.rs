//! Slicing the daemon's raw sample log.
//!
//! PTDaemon appends every sample to one log file for its whole lifetime. A
//! sample line looks like
//!
//! ```text
//! Time,10-05-2024 12:00:01.000,Watts,212.4,Volts,229.8,Amps,0.92,PF,0.99,Mark,2024-05-10_12-00-00_run_ranging
//! ```
//!
//! and carries the mark given to `Go`, so one phase's samples are exactly the
//! lines whose `Mark` field equals that phase's marker.

use crate::calibration::CalibrationRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

static SAMPLE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^Time,[^,]*,Watts,[^,]*,Volts,(?P<v>[^,]*),Amps,(?P<a>[^,]*),PF,[^,]*,Mark,(?P<mark>[^,]*)",
    )
    .expect("sample line pattern is valid")
});

/// One parsed sample line
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<'a> {
    pub volts: &'a str,
    pub amps: &'a str,
    pub mark: &'a str,
}

pub fn parse_sample(line: &str) -> Option<Sample<'_>> {
    let caps = SAMPLE_LINE.captures(line.trim_end_matches(['\r', '\n']))?;
    Some(Sample {
        volts: caps.name("v")?.as_str(),
        amps: caps.name("a")?.as_str(),
        mark: caps.name("mark")?.as_str(),
    })
}

/// Copy the lines of `raw_log` marked with `marker` into `dest`.
///
/// The destination is written to a sibling temp file and renamed into
/// place, so readers never see a partial `spl.txt`. Returns the number of
/// lines copied; zero still produces an (empty) file.
pub fn extract_marked(raw_log: &Path, marker: &str, dest: &Path) -> io::Result<usize> {
    let tmp = dest.with_extension("txt.tmp");
    let result = write_marked(raw_log, marker, &tmp);
    match result {
        Ok(count) => {
            fs::rename(&tmp, dest)?;
            Ok(count)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_marked(raw_log: &Path, marker: &str, tmp: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(raw_log)?);
    let mut out = io::BufWriter::new(File::create(tmp)?);
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        if matches!(parse_sample(&line), Some(sample) if sample.mark == marker) {
            writeln!(out, "{}", line.trim_end_matches('\r'))?;
            count += 1;
        }
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(count)
}

/// Largest volts and amps seen in an extracted sample file.
///
/// Returns `None` when no line has both values parseable and positive.
pub fn scan_maxima(spl: &Path) -> io::Result<Option<CalibrationRecord>> {
    let reader = BufReader::new(File::open(spl)?);
    let mut max: Option<CalibrationRecord> = None;
    for line in reader.lines() {
        let line = line?;
        let Some(sample) = parse_sample(&line) else {
            continue;
        };
        let (Ok(volts), Ok(amps)) = (sample.volts.parse::<f64>(), sample.amps.parse::<f64>())
        else {
            continue;
        };
        if !(volts.is_finite() && amps.is_finite()) || volts <= 0.0 || amps <= 0.0 {
            continue;
        }
        max = Some(match max {
            Some(m) => CalibrationRecord {
                max_volts: m.max_volts.max(volts),
                max_amps: m.max_amps.max(amps),
            },
            None => CalibrationRecord {
                max_volts: volts,
                max_amps: amps,
            },
        });
    }
    Ok(max)
}
