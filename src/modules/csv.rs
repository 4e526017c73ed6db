//! CSV writer.
//!
//! In file mode every identifier gets its own file under `DataDir`:
//! `<DataDir>/<plugin[-inst]>/<type[-inst]>[-YYYY-MM-DD]`, starting with an
//! `epoch,<ds names>` header. With `DataDir` set to `stdout` or `stderr` the
//! samples are streamed as `PUTVAL` lines instead.
//!
//! Options:
//! - `DataDir`: target directory, `stdout` or `stderr` (default: `csv`)
//! - `StoreRates`: accepted; rates are not computed, raw values are written
//! - `FileDate`: append the sample's date to file names (default: true)

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::plugin::{
    Configure, Flush, Init, Module, ModuleError, ModuleResult, Store,
};
use crate::types::{DataSet, Sample};

use super::parse_bool;

const DEFAULT_DATA_DIR: &str = "csv";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
    Dir(PathBuf),
}

#[derive(Debug, Clone)]
struct Settings {
    target: Target,
    store_rates: bool,
    file_date: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: Target::Dir(PathBuf::from(DEFAULT_DATA_DIR)),
            store_rates: false,
            file_date: true,
        }
    }
}

/// CSV writer module.
#[derive(Debug, Default)]
pub struct CsvWriter {
    settings: Mutex<Settings>,
}

impl CsvWriter {
    /// Writer targeting `dir`, as if configured with `DataDir`.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            settings: Mutex::new(Settings {
                target: Target::Dir(dir.into()),
                ..Default::default()
            }),
        }
    }

    /// File that receives samples for `sample`'s identifier at `time`.
    pub fn file_path(&self, sample: &Sample, time: DateTime<Utc>) -> Option<PathBuf> {
        let settings = self.settings.lock();
        match &settings.target {
            Target::Dir(dir) => Some(file_path(dir, sample, time, settings.file_date)),
            Target::Stdout | Target::Stderr => None,
        }
    }
}

fn file_path(dir: &Path, sample: &Sample, time: DateTime<Utc>, file_date: bool) -> PathBuf {
    let mut path = dir.join(sample.identifier()).into_os_string();
    if file_date {
        path.push(time.format("-%Y-%m-%d").to_string());
    }
    PathBuf::from(path)
}

fn epoch(time: DateTime<Utc>) -> String {
    format!("{:.3}", time.timestamp_millis() as f64 / 1000.0)
}

fn append(path: &Path, data_set: &DataSet, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        let names: Vec<&str> = data_set.sources.iter().map(|ds| ds.name.as_str()).collect();
        writeln!(file, "epoch,{}", names.join(","))?;
    }
    writeln!(file, "{line}")
}

impl Configure for CsvWriter {
    fn config(&self, key: &str, value: &str) -> ModuleResult {
        let mut settings = self.settings.lock();
        match key {
            "DataDir" => {
                settings.target = match value {
                    v if v.eq_ignore_ascii_case("stdout") => Target::Stdout,
                    v if v.eq_ignore_ascii_case("stderr") => Target::Stderr,
                    "" => {
                        return Err(ModuleError::InvalidOption {
                            key: key.to_string(),
                            reason: "must not be empty".to_string(),
                        });
                    }
                    dir => Target::Dir(PathBuf::from(dir)),
                };
            }
            "StoreRates" => {
                settings.store_rates = parse_bool(key, value)?;
                if settings.store_rates {
                    tracing::warn!("StoreRates is not supported, writing raw values");
                }
            }
            "FileDate" => settings.file_date = parse_bool(key, value)?,
            _ => {
                return Err(ModuleError::InvalidOption {
                    key: key.to_string(),
                    reason: "unknown option".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Init for CsvWriter {
    fn init(&self) -> ModuleResult {
        if let Target::Dir(dir) = &self.settings.lock().target {
            std::fs::create_dir_all(dir)?;
            tracing::info!(dir = %dir.display(), "CSV writer ready");
        }
        Ok(())
    }
}

impl Store for CsvWriter {
    fn write(&self, data_set: &DataSet, sample: &Sample) -> ModuleResult {
        if data_set.type_name != sample.type_name {
            return Err(ModuleError::Failed(format!(
                "data set '{}' does not describe sample type '{}'",
                data_set.type_name, sample.type_name
            )));
        }

        let settings = self.settings.lock().clone();
        let time = sample.time.unwrap_or_else(Utc::now);
        let values: Vec<String> = sample.values.iter().map(ToString::to_string).collect();

        match &settings.target {
            Target::Dir(dir) => {
                let path = file_path(dir, sample, time, settings.file_date);
                append(&path, data_set, &format!("{},{}", epoch(time), values.join(",")))?;
            }
            stream => {
                let line = format!(
                    "PUTVAL {} interval={:.3} {}:{}",
                    sample.identifier(),
                    sample.interval.as_secs_f64(),
                    epoch(time),
                    values.join(":")
                );
                if *stream == Target::Stdout {
                    writeln!(io::stdout().lock(), "{line}")?;
                } else {
                    writeln!(io::stderr().lock(), "{line}")?;
                }
            }
        }
        Ok(())
    }
}

impl Flush for CsvWriter {
    fn flush(&self) -> ModuleResult {
        match self.settings.lock().target {
            Target::Stdout => io::stdout().flush()?,
            Target::Stderr => io::stderr().flush()?,
            Target::Dir(_) => {}
        }
        Ok(())
    }
}

impl Module for CsvWriter {
    fn as_config(&self) -> Option<&dyn Configure> {
        Some(self)
    }

    fn as_init(&self) -> Option<&dyn Init> {
        Some(self)
    }

    fn as_store(&self) -> Option<&dyn Store> {
        Some(self)
    }

    fn as_flush(&self) -> Option<&dyn Flush> {
        Some(self)
    }
}
