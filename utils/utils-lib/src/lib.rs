pub mod constants;
pub use constants::*;

pub mod tracing_telemetry;

/// Description of the calling package, suitable for clap's `name`.
#[macro_export]
macro_rules! package_description {
    () => {
        env!("CARGO_PKG_DESCRIPTION")
    };
}

/// Version of the calling package, suitable for clap's `version`.
#[macro_export]
macro_rules! package_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

/// Logs the package name and version of the calling package.
#[macro_export]
macro_rules! print_package_info {
    () => {
        tracing::info!(
            package = env!("CARGO_PKG_NAME"),
            version = env!("CARGO_PKG_VERSION"),
            "Starting"
        );
    };
}
