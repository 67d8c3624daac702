//! Running statistics folded from the delivery queue.
//!
//! The [`AggregationEngine`](../engine/struct.AggregationEngine.html) folds every
//! [`IterationEnvelope`] into a [`RunAggregate`], and every contained
//! [`RequestOutcome`] into the [`ScenarioItemAggregate`] of its scenario item.
//! When the queue closes the [`RunAggregate`] becomes read-only and is handed to
//! reporters.
//!
//! When the [`RunAggregate`] is viewed with [`std::fmt::Display`], the per-item
//! aggregates are displayed in tables:
//! ```text
//!  === PER ITEM METRICS ===
//!  ------------------------------------------------------------------------------
//!  Item                     |      # total |     # success |       # fails
//!  ------------------------------------------------------------------------------
//!  #1                       |            2 |      2 (100%) |        0 (0%)
//!  #2                       |            2 |       1 (50%) |       1 (50%)
//!  ------------------------------------------------------------------------------
//!  Item                     | Component                |             Mean
//!  ------------------------------------------------------------------------------
//!  #1                       | connDuration             |           12.50s
//!                           | dnsDuration              |            7.50s
//!                           | duration                 |           20.00s
//!  #2                       | connDuration             |           40.00s
//!                           | dnsDuration              |           20.00s
//!                           | duration                 |           60.00s
//! ```

use http::StatusCode;
use itertools::Itertools;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::outcome::{IterationEnvelope, RequestOutcome};
use crate::util;

/// Reserved latency key holding the mean total duration of a scenario item.
pub const TOTAL_DURATION_KEY: &str = "duration";

/// An arithmetic mean updated one value at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    count: usize,
    mean: f64,
}
impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean = util::mean_update(self.mean, value, self.count);
    }

    /// The mean of every value pushed so far, 0 if nothing was pushed.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// How many values were pushed.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Running statistics for one scenario item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScenarioItemAggregate {
    /// Outcomes without an error.
    pub success_count: usize,
    /// Outcomes carrying an error.
    pub failed_count: usize,
    /// How often each status code was returned.
    pub status_code_distribution: HashMap<u16, usize>,
    /// How often each error reason was recorded.
    pub error_distribution: HashMap<String, usize>,
    /// Mean latency per component of successful outcomes, in seconds. The
    /// [`TOTAL_DURATION_KEY`] entry holds the mean total duration.
    pub durations: BTreeMap<String, RunningMean>,
}
impl ScenarioItemAggregate {
    pub fn new() -> Self {
        ScenarioItemAggregate::default()
    }

    /// Incorporate one outcome of this scenario item.
    ///
    /// Failed outcomes count toward the failure counter and the error
    /// distribution; only successful outcomes feed the latency means, as a failed
    /// attempt's timings describe how long it took to fail.
    pub fn fold(&mut self, outcome: &RequestOutcome) {
        if let Some(status_code) = outcome.status_code.filter(|code| *code != 0) {
            *self.status_code_distribution.entry(status_code).or_insert(0) += 1;
        }

        match &outcome.error {
            Some(error) => {
                self.failed_count += 1;
                match self.error_distribution.get_mut(&error.reason) {
                    Some(counter) => *counter += 1,
                    None => {
                        self.error_distribution.insert(error.reason.clone(), 1);
                    }
                }
            }
            None => {
                self.success_count += 1;
                for (component, elapsed) in &outcome.timing_breakdown {
                    // The reserved key only ever holds the total.
                    if component == TOTAL_DURATION_KEY {
                        continue;
                    }
                    self.push_duration(component, elapsed.as_secs_f64());
                }
                self.push_duration(TOTAL_DURATION_KEY, outcome.duration.as_secs_f64());
            }
        }
    }

    fn push_duration(&mut self, component: &str, seconds: f64) {
        match self.durations.get_mut(component) {
            Some(mean) => mean.push(seconds),
            None => {
                let mut mean = RunningMean::default();
                mean.push(seconds);
                self.durations.insert(component.to_string(), mean);
            }
        }
    }

    /// Number of outcomes folded so far.
    pub fn total_count(&self) -> usize {
        self.success_count + self.failed_count
    }

    pub fn success_percentage(&self) -> u8 {
        util::split_percentages(self.success_count, self.failed_count).0
    }

    pub fn failed_percentage(&self) -> u8 {
        util::split_percentages(self.success_count, self.failed_count).1
    }

    /// Mean latency of one component in seconds, `None` if no successful outcome
    /// reported it.
    pub fn duration_average(&self, component: &str) -> Option<f64> {
        self.durations.get(component).map(RunningMean::mean)
    }

    /// Mean latency of every component seen so far, in seconds.
    pub fn duration_averages(&self) -> BTreeMap<&str, f64> {
        self.durations
            .iter()
            .map(|(component, mean)| (component.as_str(), mean.mean()))
            .collect()
    }
}
impl Serialize for ScenarioItemAggregate {
    // Serialized by hand to include percentages and to flatten the means.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("ScenarioItemAggregate", 7)?;
        s.serialize_field("success_count", &self.success_count)?;
        s.serialize_field("success_percentage", &self.success_percentage())?;
        s.serialize_field("failed_count", &self.failed_count)?;
        s.serialize_field("failed_percentage", &self.failed_percentage())?;
        let status_codes: BTreeMap<&u16, &usize> = self.status_code_distribution.iter().collect();
        s.serialize_field("status_code_distribution", &status_codes)?;
        let errors: BTreeMap<&String, &usize> = self.error_distribution.iter().collect();
        s.serialize_field("error_distribution", &errors)?;
        s.serialize_field("durations", &self.duration_averages())?;
        s.end()
    }
}

/// A point-in-time view of a run that is still being aggregated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub success_count: usize,
    pub failed_count: usize,
    /// Mean duration of successful iterations, in seconds.
    pub avg_duration: f64,
}
impl fmt::Display for RunProgress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let (success_percentage, failed_percentage) =
            util::split_percentages(self.success_count, self.failed_count);
        write!(
            fmt,
            "iterations: {} | success: {} ({}%) | failed: {} ({}%) | avg duration: {}",
            util::format_number(self.success_count + self.failed_count),
            util::format_number(self.success_count),
            success_percentage,
            util::format_number(self.failed_count),
            failed_percentage,
            util::format_seconds(self.avg_duration),
        )
    }
}

/// Running statistics for a whole run.
///
/// Counters are per iteration: an iteration with at least one failed outcome is
/// counted as failed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunAggregate {
    /// Iterations without any failed outcome.
    pub success_count: usize,
    /// Iterations with at least one failed outcome.
    pub failed_count: usize,
    /// Mean total duration of successful iterations, in seconds.
    pub avg_duration: f64,
    /// Per scenario item statistics, created the first time an item is seen.
    pub item_aggregates: BTreeMap<u16, ScenarioItemAggregate>,
}
impl RunAggregate {
    pub fn new() -> Self {
        RunAggregate::default()
    }

    /// Incorporate every outcome of one iteration.
    pub fn fold(&mut self, envelope: &IterationEnvelope) {
        if envelope.has_failure() {
            self.failed_count += 1;
        } else {
            self.success_count += 1;
            self.avg_duration = util::mean_update(
                self.avg_duration,
                envelope.total_duration().as_secs_f64(),
                self.success_count,
            );
        }

        for outcome in &envelope.outcomes {
            self.item_aggregates
                .entry(outcome.scenario_item_id)
                .or_insert_with(|| {
                    debug!("first outcome for scenario item {}", outcome.scenario_item_id);
                    ScenarioItemAggregate::new()
                })
                .fold(outcome);
        }
    }

    /// Number of iterations folded so far.
    pub fn total_count(&self) -> usize {
        self.success_count + self.failed_count
    }

    pub fn success_percentage(&self) -> u8 {
        util::split_percentages(self.success_count, self.failed_count).0
    }

    pub fn failed_percentage(&self) -> u8 {
        util::split_percentages(self.success_count, self.failed_count).1
    }

    pub fn item(&self, scenario_item_id: u16) -> Option<&ScenarioItemAggregate> {
        self.item_aggregates.get(&scenario_item_id)
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            success_count: self.success_count,
            failed_count: self.failed_count,
            avg_duration: self.avg_duration,
        }
    }

    /// Prepares a table of outcome counts per scenario item.
    pub(crate) fn fmt_items(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER ITEM METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>12} | {:>13} | {:>13}",
            "Item", "# total", "# success", "# fails"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (id, item) in &self.item_aggregates {
            writeln!(
                fmt,
                " {:<24} | {:>12} | {:>13} | {:>13}",
                format!("#{}", id),
                util::format_number(item.total_count()),
                format!(
                    "{} ({}%)",
                    util::format_number(item.success_count),
                    item.success_percentage()
                ),
                format!(
                    "{} ({}%)",
                    util::format_number(item.failed_count),
                    item.failed_percentage()
                ),
            )?;
        }

        Ok(())
    }

    /// Prepares a table of mean latency per component.
    pub(crate) fn fmt_durations(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:<24} | {:>16}", "Item", "Component", "Mean")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (id, item) in &self.item_aggregates {
            let mut label = format!("#{}", id);
            for (component, mean) in item.duration_averages() {
                writeln!(
                    fmt,
                    " {:<24} | {:<24} | {:>16}",
                    label,
                    component,
                    util::format_seconds(mean)
                )?;
                // Only label the first row of each item.
                label.clear();
            }
        }

        Ok(())
    }

    /// Prepares a table of status codes per scenario item.
    pub(crate) fn fmt_status_codes(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self
            .item_aggregates
            .values()
            .all(|item| item.status_code_distribution.is_empty())
        {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>51} ", "Item", "Status codes")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (id, item) in &self.item_aggregates {
            writeln!(
                fmt,
                " {:<24} | {:>51}",
                format!("#{}", id),
                prepare_status_codes(&item.status_code_distribution),
            )?;
        }

        Ok(())
    }

    /// Prepares a table of errors, the most frequent first.
    pub(crate) fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors: Vec<(usize, u16, &str)> = Vec::new();
        for (id, item) in &self.item_aggregates {
            for (reason, occurrences) in &item.error_distribution {
                errors.push((*occurrences, *id, reason.as_str()));
            }
        }
        if errors.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === ERRORS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | {:<10} | Reason", "Count", "Item")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (occurrences, id, reason) in errors.iter().sorted().rev() {
            writeln!(
                fmt,
                " {:<11} | {:<10} | {}",
                util::format_number(*occurrences),
                format!("#{}", id),
                reason
            )?;
        }

        Ok(())
    }

    /// Prepares the run totals.
    pub(crate) fn fmt_summary(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === RUN SUMMARY ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>12}",
            "Iterations",
            util::format_number(self.total_count())
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>12}",
            "Successful",
            format!(
                "{} ({}%)",
                util::format_number(self.success_count),
                self.success_percentage()
            )
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>12}",
            "Failed",
            format!(
                "{} ({}%)",
                util::format_number(self.failed_count),
                self.failed_percentage()
            )
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>12}",
            "Avg. duration",
            util::format_seconds(self.avg_duration)
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }
}
impl Serialize for RunAggregate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("RunAggregate", 6)?;
        s.serialize_field("success_count", &self.success_count)?;
        s.serialize_field("success_percentage", &self.success_percentage())?;
        s.serialize_field("failed_count", &self.failed_count)?;
        s.serialize_field("failed_percentage", &self.failed_percentage())?;
        s.serialize_field("avg_duration", &self.avg_duration)?;
        s.serialize_field("items", &self.item_aggregates)?;
        s.end()
    }
}

/// Implement format trait to allow displaying aggregated metrics.
impl fmt::Display for RunAggregate {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // Nothing but the totals to show for an empty run.
        if !self.item_aggregates.is_empty() {
            self.fmt_items(fmt)?;
            self.fmt_durations(fmt)?;
            self.fmt_status_codes(fmt)?;
            self.fmt_errors(fmt)?;
        }
        self.fmt_summary(fmt)
    }
}

/// Format a status code distribution as `200 OK [2], 404 Not Found [1]`.
pub(crate) fn prepare_status_codes(status_code_counts: &HashMap<u16, usize>) -> String {
    status_code_counts
        .iter()
        .sorted()
        .map(|(status_code, count)| {
            let reason = StatusCode::from_u16(*status_code)
                .ok()
                .and_then(|status| status.canonical_reason());
            match reason {
                Some(reason) => format!(
                    "{} {} [{}]",
                    status_code,
                    reason,
                    util::format_number(*count)
                ),
                None => format!("{} [{}]", status_code, util::format_number(*count)),
            }
        })
        .join(", ")
}
