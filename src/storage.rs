use crate::model::Report;
use anyhow::{Context, Result};
use std::path::Path;

const CSV_HEADER: &str = "run_id,base_url,state,started_at,completed_at,idle_median_ms,idle_jitter_ms,idle_loss_percent,download_mbps,upload_mbps,dl_loaded_median_ms,dl_loaded_jitter_ms,dl_loaded_loss_percent,ul_loaded_median_ms,ul_loaded_jitter_ms,ul_loaded_loss_percent,bufferbloat_ms,error\n";

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    Ok(())
}

pub fn export_json(path: &Path, report: &Report) -> Result<()> {
    create_parent(path)?;
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, data).context("write export json")?;
    Ok(())
}

pub fn load_json(path: &Path) -> Result<Report> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

pub fn export_csv(path: &Path, report: &Report) -> Result<()> {
    create_parent(path)?;
    std::fs::write(path, report_to_csv(report)).context("write export csv")?;
    Ok(())
}

/// Header plus one row of scalar metrics. Absent values are empty cells.
pub fn report_to_csv(report: &Report) -> String {
    fn opt(v: Option<f64>) -> String {
        v.map(|v| format!("{:.3}", v)).unwrap_or_default()
    }

    let m = &report.metrics;
    let state = serde_json::to_value(report.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let mut out = String::from(CSV_HEADER);
    out.push_str(&format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
        csv_escape(&report.run_id),
        csv_escape(&report.base_url),
        state,
        csv_escape(&report.started_at),
        csv_escape(&report.completed_at),
        opt(m.idle_latency_median_ms),
        opt(m.idle_jitter_ms),
        opt(m.idle_loss_percent),
        opt(m.download_mbps),
        opt(m.upload_mbps),
        opt(m.loaded_download_median_ms),
        opt(m.loaded_download_jitter_ms),
        opt(m.loaded_download_loss_percent),
        opt(m.loaded_upload_median_ms),
        opt(m.loaded_upload_jitter_ms),
        opt(m.loaded_upload_loss_percent),
        opt(m.bufferbloat_ms),
        csv_escape(report.error.as_deref().unwrap_or("")),
    ));
    out
}

/// Escape a string for CSV format (handles commas, quotes, and newlines).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        IdleResult, MeasurementSettings, Metrics, PhaseResult, RunState, Sample, TransferStats,
    };
    use std::path::PathBuf;

    fn sample_report() -> Report {
        let series = vec![
            Sample {
                at_ms: 1_000.0,
                value: 94.5,
            },
            Sample {
                at_ms: 2_000.0,
                value: 101.25,
            },
        ];
        let phase = PhaseResult {
            throughput_mbps: 97.875,
            total_bytes: 24_467_000,
            duration_ms: 2_000,
            series,
            loaded_latencies: vec![Sample {
                at_ms: 1_250.5,
                value: 48.0,
            }],
            loaded_loss: 1,
            transfers: TransferStats {
                completed: 6,
                failed: 1,
                timed_out: 0,
            },
        };
        Report {
            version: Some("0.1.0".into()),
            run_id: "8812".into(),
            base_url: "http://localhost:3000/api/speed/".into(),
            state: RunState::Done,
            error: None,
            started_at: "2026-10-18T09:00:00Z".into(),
            completed_at: "2026-10-18T09:00:19Z".into(),
            settings: MeasurementSettings::default(),
            idle: Some(IdleResult {
                latencies: vec![
                    Sample {
                        at_ms: 12.0,
                        value: 11.5,
                    },
                    Sample {
                        at_ms: 144.0,
                        value: 13.0,
                    },
                ],
                lost: 0,
            }),
            download: Some(phase.clone()),
            upload: Some(phase),
            metrics: Metrics {
                idle_latency_median_ms: Some(11.5),
                idle_jitter_ms: Some(1.5),
                idle_loss_percent: Some(0.0),
                download_mbps: Some(97.875),
                upload_mbps: Some(97.875),
                loaded_download_median_ms: Some(48.0),
                loaded_download_loss_percent: Some(50.0),
                bufferbloat_ms: Some(36.5),
                ..Metrics::default()
            },
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("netdiag-speed-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn json_export_loads_back() {
        let report = sample_report();
        let path = temp_path("report.json");
        export_json(&path, &report).unwrap();
        let loaded = load_json(&path).unwrap();
        assert_eq!(loaded, report);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn json_uses_snake_case_and_lowercase_state() {
        let v = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(v["state"], "done");
        assert!(v["metrics"]["idle_latency_median_ms"].is_number());
        assert!(v["metrics"]["upload_mbps"].is_number());
        assert!(v["metrics"]["loaded_upload_median_ms"].is_null());
    }

    #[test]
    fn loading_garbage_fails_with_path() {
        let path = temp_path("garbage.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        let err = load_json(&path).unwrap_err();
        assert!(format!("{err:#}").contains("garbage.json"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn csv_has_header_and_one_row() {
        let csv = report_to_csv(&sample_report());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        let header: Vec<&str> = lines[0].split(',').collect();
        let row: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(header.len(), row.len());

        let col = |name: &str| row[header.iter().position(|h| *h == name).unwrap()];
        assert_eq!(col("state"), "done");
        assert_eq!(col("download_mbps"), "97.875");
        assert_eq!(col("bufferbloat_ms"), "36.500");
        assert_eq!(col("ul_loaded_median_ms"), "");
        assert_eq!(col("error"), "");
    }

    #[test]
    fn csv_escapes_error_text() {
        let mut report = sample_report();
        report.state = RunState::Error;
        report.error = Some("upload phase failed: \"boom\", retry".into());
        let csv = report_to_csv(&report);
        assert!(csv
            .lines()
            .nth(1)
            .unwrap()
            .ends_with("\"upload phase failed: \"\"boom\"\", retry\""));
    }

    #[test]
    fn csv_export_writes_file() {
        let path = temp_path("nested/report.csv");
        export_csv(&path, &sample_report()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("run_id,base_url,state"));
        std::fs::remove_file(&path).ok();
    }
}
