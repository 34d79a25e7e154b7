use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Fmt Layer for console output.
#[derive(Debug, Clone, Copy)]
pub enum FmtLayer {
    /// Output traces to stdout.
    Stdout,
    /// Output traces to stderr.
    Stderr,
    /// Don't output traces to console.
    None,
}

/// Tracing telemetry style.
#[derive(Debug, Clone, Copy, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty Style.
    Pretty,
    /// JSON Style.
    Json,
}

/// The filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Get the `RUST_LOG` env filter, falling back to `info`.
pub fn rust_log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Tracing telemetry builder.
pub struct TracingTelemetry {
    writer: FmtLayer,
    style: FmtStyle,
    colours: bool,
}

impl TracingTelemetry {
    /// Tracing telemetry default builder.
    pub fn builder() -> Self {
        Self {
            writer: FmtLayer::Stdout,
            style: FmtStyle::Pretty,
            colours: true,
        }
    }
    /// Specify writer stream.
    pub fn with_writer(self, writer: FmtLayer) -> TracingTelemetry {
        TracingTelemetry { writer, ..self }
    }
    /// Specify style.
    pub fn with_style(self, style: FmtStyle) -> TracingTelemetry {
        TracingTelemetry { style, ..self }
    }
    /// Specify whether colour is needed or not.
    pub fn with_colours(self, colours: bool) -> TracingTelemetry {
        TracingTelemetry { colours, ..self }
    }

    /// Initialize the telemetry instance.
    /// A second initialization in the same process is silently ignored.
    pub fn init(self, service_name: &str) {
        let console = match self.writer {
            FmtLayer::Stdout => Some(styled(std::io::stdout, self.style, self.colours)),
            FmtLayer::Stderr => Some(styled(std::io::stderr, self.style, self.colours)),
            FmtLayer::None => None,
        };

        let initialised = Registry::default()
            .with(console)
            .with(rust_log_filter())
            .try_init()
            .is_ok();
        if initialised {
            tracing::debug!(
                service = service_name,
                style = self.style.as_ref(),
                "Tracing initialised"
            );
        }
    }
}

/// Build a console fmt layer over the given writer with the requested style.
fn styled<W>(writer: W, style: FmtStyle, colours: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(colours);
    match style {
        FmtStyle::Compact => layer.compact().boxed(),
        FmtStyle::Pretty => layer.pretty().boxed(),
        FmtStyle::Json => layer.json().boxed(),
    }
}
