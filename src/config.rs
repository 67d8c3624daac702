//! Functions and structures related to configuring the reporting pipeline.
//!
//! The pipeline can be configured at run time by passing in the options and flags
//! defined by the [`VolleyConfiguration`] structure, or programmatically by
//! building one and handing it to
//! [`ReportPipeline::initialize_with_config`](../struct.ReportPipeline.html#method.initialize_with_config).

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::report::ReportFormat;
use crate::util;
use crate::VolleyError;

/// Capacity of each delivery queue unless `--queue-size` is set.
pub const DEFAULT_QUEUE_SIZE: usize = 1_000;

/// Runtime options available when aggregating a load test.
///
/// Volley leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Volley aggregates the outcomes of a load test into per-item and per-run
statistics, and renders them once the run completes.

The following runtime options are available:"#
)]
pub struct VolleyConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Adds a report output, may be repeated (console, json)
    #[options(short = "o", meta = "FORMAT")]
    pub output: Vec<ReportFormat>,
    /// How often to optionally print running metrics (30s, 1m, etc)
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<String>,
    /// Sets the capacity of each delivery queue (default: 1000)
    #[options(no_short, meta = "SIZE")]
    pub queue_size: Option<usize>,
    /// Enables the log file and sets its name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}
impl VolleyConfiguration {
    /// The report outputs to build, `console` if none were configured.
    pub fn outputs(&self) -> Vec<ReportFormat> {
        if self.output.is_empty() {
            return vec![ReportFormat::Console];
        }
        let mut outputs: Vec<ReportFormat> = Vec::with_capacity(self.output.len());
        for format in &self.output {
            if !outputs.contains(format) {
                outputs.push(*format);
            }
        }
        outputs
    }

    /// Capacity of each delivery queue.
    pub fn delivery_queue_capacity(&self) -> usize {
        self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE)
    }

    /// How often to print running metrics, `None` if disabled.
    pub fn running_metrics_interval(&self) -> Option<Duration> {
        let seconds = util::parse_timespan(self.running_metrics.as_ref()?);
        if seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(seconds as u64))
        }
    }

    /// Validate the configured options.
    pub fn validate(&self) -> Result<(), VolleyError> {
        if self.queue_size == Some(0) {
            return Err(VolleyError::InvalidOption {
                option: "`configuration.queue_size`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.queue_size` must be at least 1.".to_string(),
            });
        }

        if let Some(running_metrics) = &self.running_metrics {
            if util::parse_timespan(running_metrics) == 0 {
                return Err(VolleyError::InvalidOption {
                    option: "`configuration.running_metrics`".to_string(),
                    value: running_metrics.to_string(),
                    detail: "`configuration.running_metrics` must be a timespan of at least one second, for example 30s or 1m.".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Initialize the logger, which writes to standard out and optionally to a
    /// configurable log file.
    pub fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        let mut log_file: Option<PathBuf> = None;
        if !self.log_file.is_empty() {
            let path = PathBuf::from(&self.log_file);
            match std::fs::File::create(&path) {
                Ok(file) => {
                    loggers.push(WriteLogger::new(log_level, Config::default(), file));
                    log_file = Some(path);
                }
                Err(e) => {
                    eprintln!("failed to create log file {}: {}", path.display(), e);
                }
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }

        if let Some(path) = log_file {
            info!("Writing to log file: {}", path.display());
        }
        debug!("Output verbosity level: {}", debug_level);
        debug!("Logfile verbosity level: {}", log_level);
    }
}
