//! System load average collector.
//!
//! Reads `/proc/loadavg` and submits one `load` sample with the 1, 5 and 15
//! minute averages. With `ReportRelative` the averages are divided by the
//! number of available CPUs and tagged with type instance `relative`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::plugin::{Collect, Configure, Module, ModuleError, ModuleResult, ReadContext};
use crate::types::{Sample, Value};

use super::parse_bool;

const PROC_LOADAVG: &str = "/proc/loadavg";

/// Load average collector.
#[derive(Debug)]
pub struct Load {
    source: PathBuf,
    relative: AtomicBool,
}

impl Default for Load {
    fn default() -> Self {
        Self::with_source(PROC_LOADAVG)
    }
}

impl Load {
    /// Collector reading an alternative `/proc/loadavg`-formatted file.
    pub fn with_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            relative: AtomicBool::new(false),
        }
    }

    fn averages(&self) -> Result<[f64; 3], ModuleError> {
        let content = std::fs::read_to_string(&self.source)?;
        let mut fields = content.split_whitespace().map(str::parse::<f64>);
        let mut averages = [0.0; 3];
        for slot in &mut averages {
            *slot = match fields.next() {
                Some(Ok(v)) => v,
                _ => {
                    return Err(ModuleError::Failed(format!(
                        "malformed load average in {}",
                        self.source.display()
                    )));
                }
            };
        }
        Ok(averages)
    }
}

impl Configure for Load {
    fn config(&self, key: &str, value: &str) -> ModuleResult {
        match key {
            "ReportRelative" => {
                self.relative.store(parse_bool(key, value)?, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(ModuleError::InvalidOption {
                key: key.to_string(),
                reason: "unknown option".to_string(),
            }),
        }
    }
}

impl Collect for Load {
    fn read(&self, ctx: &ReadContext<'_>) -> ModuleResult {
        let mut averages = self.averages()?;
        let mut sample = Sample::new("load", "load");

        if self.relative.load(Ordering::Relaxed) {
            let cpus = std::thread::available_parallelism()?.get() as f64;
            averages.iter_mut().for_each(|v| *v /= cpus);
            sample = sample.with_type_instance("relative");
        }

        ctx.submit(&sample.with_values(averages.map(Value::Gauge).to_vec()))
    }
}

impl Module for Load {
    fn as_config(&self) -> Option<&dyn Configure> {
        Some(self)
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::{drain, pipeline};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn loadavg(content: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn test_read_submits_three_gauges() {
        let file = loadavg("0.25 0.50 1.75 2/512 12345\n");
        let load = Load::with_source(file.path());

        let (dispatcher, recorder) = pipeline();
        let submitter = dispatcher.submitter();
        load.read(&ReadContext::new(&submitter, Duration::from_secs(10)))
            .unwrap();
        drain(&dispatcher);

        let samples = recorder.0.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].identifier(), "load/load");
        assert_eq!(
            samples[0].values,
            vec![Value::Gauge(0.25), Value::Gauge(0.5), Value::Gauge(1.75)]
        );
    }

    #[test]
    fn test_report_relative() {
        let file = loadavg("4.0 4.0 4.0 1/1 1\n");
        let load = Load::with_source(file.path());
        load.config("ReportRelative", "true").unwrap();

        let (dispatcher, recorder) = pipeline();
        let submitter = dispatcher.submitter();
        load.read(&ReadContext::new(&submitter, Duration::from_secs(1)))
            .unwrap();
        drain(&dispatcher);

        let cpus = std::thread::available_parallelism().unwrap().get() as f64;
        let samples = recorder.0.lock();
        assert_eq!(samples[0].type_instance, "relative");
        assert_eq!(samples[0].values[0], Value::Gauge(4.0 / cpus));
    }

    #[test]
    fn test_unknown_option_and_malformed_source() {
        let file = loadavg("1.0 x\n");
        let load = Load::with_source(file.path());
        assert!(matches!(
            load.config("Bogus", "1"),
            Err(ModuleError::InvalidOption { .. })
        ));
        assert!(matches!(load.averages(), Err(ModuleError::Failed(_))));
    }
}
