//! Export of stored readings and derived reports.

use crate::config::{ConfigManager, ExportFormat, ExportSettings, MAX_EXPORT_INTERVAL_HOURS};
use crate::error::ExportError;
use crate::stats::StatisticsSnapshot;
use crate::store::{Reading, TimeSeriesStore};
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How often a disabled auto-export re-reads its settings.
pub const AUTO_EXPORT_POLL: Duration = Duration::from_secs(60);

/// One line per reading: `timestamp,power_kw`.
pub fn write_csv<W: Write>(readings: &[Reading], mut writer: W) -> io::Result<()> {
    writeln!(writer, "timestamp,power_kw")?;
    for reading in readings {
        writeln!(
            writer,
            "{},{}",
            reading.timestamp.format(TIMESTAMP_FORMAT),
            reading.power_kw
        )?;
    }
    writer.flush()
}

/// Plain-text summary of a statistics snapshot, daily figures newest first.
pub fn write_statistics_report<W: Write>(
    snapshot: &StatisticsSnapshot,
    generated_at: NaiveDateTime,
    mut writer: W,
) -> io::Result<()> {
    writeln!(writer, "PHOTOVOLTAIC PLANT STATISTICS")?;
    writeln!(writer, "=============================")?;
    writeln!(writer)?;
    writeln!(writer, "Report date: {}", generated_at.format(TIMESTAMP_FORMAT))?;
    writeln!(writer)?;

    let peak_at = snapshot
        .max_time
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "n/a".to_string());
    writeln!(
        writer,
        "Peak power: {:.2} kW (recorded at {})",
        snapshot.max_power, peak_at
    )?;
    writeln!(writer, "Average power: {:.2} kW", snapshot.avg_power)?;
    writeln!(writer, "Total energy produced: {:.2} kWh", snapshot.total_energy_kwh)?;
    writeln!(writer, "Current month energy: {:.2} kWh", snapshot.monthly_energy)?;
    writeln!(writer, "Operating hours: {:.1} h", snapshot.operating_hours)?;
    match &snapshot.best_day {
        Some(best) => writeln!(writer, "Best day: {} ({:.2} kWh)", best.date, best.energy_kwh)?,
        None => writeln!(writer, "Best day: n/a")?,
    }
    writeln!(writer)?;

    writeln!(writer, "DAILY PRODUCTION")?;
    writeln!(writer, "----------------")?;
    writeln!(writer)?;
    for (date, energy) in snapshot.daily_energy.iter().rev() {
        writeln!(writer, "{}: {:.2} kWh", date, energy)?;
    }
    writer.flush()
}

/// Month rollup as CSV: `month,energy_kwh`.
pub fn write_monthly_csv<W: Write>(rollup: &BTreeMap<String, f64>, mut writer: W) -> io::Result<()> {
    writeln!(writer, "month,energy_kwh")?;
    for (month, energy) in rollup {
        writeln!(writer, "{},{:.2}", month, energy)?;
    }
    writer.flush()
}

/// Create `path` and hand a buffered writer to `write`.
fn write_file<F>(path: &Path, write: F) -> Result<(), ExportError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let wrap = |source: io::Error| ExportError::WriteFailed {
        path: path.display().to_string(),
        source,
    };
    let file = File::create(path).map_err(wrap)?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).map_err(wrap)?;
    writer.into_inner().map_err(|e| wrap(e.into_error()))?.sync_all().map_err(wrap)
}

fn ensure_folder(folder: &Path) -> Result<(), ExportError> {
    fs::create_dir_all(folder).map_err(|source| ExportError::WriteFailed {
        path: folder.display().to_string(),
        source,
    })
}

/// Place a client-supplied export path inside `folder`.
///
/// Relative paths are joined onto the folder. Absolute paths must already lie
/// under it, and `..` is refused anywhere.
pub fn resolve_export_path(folder: &Path, requested: &Path) -> Result<PathBuf, ExportError> {
    let outside = || ExportError::OutsideExportFolder {
        path: requested.display().to_string(),
        folder: folder.display().to_string(),
    };

    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(outside());
    }

    let resolved = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        folder.join(requested)
    };
    if !resolved.starts_with(folder) || resolved == folder {
        return Err(outside());
    }

    if let Some(parent) = resolved.parent() {
        ensure_folder(parent)?;
    }
    Ok(resolved)
}

/// Export the last `days` days of readings to a CSV file.
pub fn export_csv_file(store: &TimeSeriesStore, days: u32, path: &Path) -> Result<usize, ExportError> {
    let readings = store.export_range(days);
    write_file(path, |w| write_csv(&readings, w))?;
    info!("Exported {} readings to {:?}", readings.len(), path);
    Ok(readings.len())
}

pub fn export_report_file(
    snapshot: &StatisticsSnapshot,
    path: &Path,
) -> Result<(), ExportError> {
    write_file(path, |w| write_statistics_report(snapshot, Local::now().naive_local(), w))
}

pub fn export_monthly_file(rollup: &BTreeMap<String, f64>, path: &Path) -> Result<(), ExportError> {
    write_file(path, |w| write_monthly_csv(rollup, w))
}

/// Archive copy of the backing document, as stored.
pub fn export_raw_file(store: &TimeSeriesStore, path: &Path) -> Result<(), ExportError> {
    store.copy_backing_file(path)?;
    info!("Copied energy data file to {:?}", path);
    Ok(())
}

/// `auto_export_<YYYYMMDD_HHMMSS>.<ext>` inside the configured folder.
pub fn auto_export_path(settings: &ExportSettings, now: NaiveDateTime) -> PathBuf {
    let extension = match settings.format {
        ExportFormat::Csv => "csv",
        ExportFormat::Json => "json",
    };
    settings.folder.join(format!(
        "auto_export_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        extension
    ))
}

/// Write one auto-export: all retained readings as CSV, or a copy of the
/// backing document as JSON.
pub fn auto_export_once(
    store: &TimeSeriesStore,
    settings: &ExportSettings,
    now: NaiveDateTime,
) -> Result<PathBuf, ExportError> {
    ensure_folder(&settings.folder)?;

    let path = auto_export_path(settings, now);
    match settings.format {
        ExportFormat::Csv => {
            let readings = store.load_all();
            write_file(&path, |w| write_csv(&readings, w))?;
        }
        ExportFormat::Json => store.copy_backing_file(&path)?,
    }
    Ok(path)
}

/// Periodic export task. Settings are re-read every round.
pub async fn run_auto_export(
    store: Arc<TimeSeriesStore>,
    config: Arc<ConfigManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let settings = config.get().export;
        let wait = if settings.auto_enabled {
            match auto_export_once(&store, &settings, Local::now().naive_local()) {
                Ok(path) => info!("Automatic export completed: {:?}", path),
                Err(e) => error!("Automatic export failed: {}", e),
            }
            let hours = settings.interval_hours.clamp(1, MAX_EXPORT_INTERVAL_HOURS);
            Duration::from_secs(u64::from(hours) * 3600)
        } else {
            AUTO_EXPORT_POLL
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Auto-export shutting down");
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
