//! Daemon logging: console output plus an optional telemetry file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;

const METRICS_TARGET_PREFIX: &str = "metrics.";

/// Writes `metrics.*` events as `measurement,tag=v field=v timestamp` lines.
/// Fields named `tag_*` become tags.
struct TelemetryLineFormatter;

#[derive(Default)]
struct FieldVisitor {
    tags: BTreeMap<&'static str, String>,
    fields: BTreeMap<&'static str, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        let name = field.name();
        match name.strip_prefix("tag_") {
            Some(tag) => {
                self.tags.insert(tag, value);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for TelemetryLineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let target = event.metadata().target();
        write!(
            writer,
            "{}",
            target.strip_prefix(METRICS_TARGET_PREFIX).unwrap_or(target)
        )?;
        for (key, value) in &visitor.tags {
            write!(writer, ",{key}={value}")?;
        }

        let fields = visitor
            .fields
            .iter()
            .filter(|(key, _)| **key != "message")
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        writeln!(writer, " {fields} {timestamp}")
    }
}

fn is_metrics(target: &str) -> bool {
    target.starts_with(METRICS_TARGET_PREFIX)
}

/// Installs the global subscriber. The returned guard flushes the telemetry
/// file on drop and must be held for the life of the process.
pub(crate) fn init(telemetry_log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| !is_metrics(metadata.target()))),
    );

    let (metrics_layer, guard) = match telemetry_log {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("invalid telemetry log path {}", path.display()))?;

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(directory)
                .context("failed to create telemetry log appender")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let metrics_layer = layer()
                .event_format(TelemetryLineFormatter)
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter::filter_fn(|metadata| is_metrics(metadata.target())));
            (Some(metrics_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(guard)
}
