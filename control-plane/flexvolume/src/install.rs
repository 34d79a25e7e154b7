use snafu::{ResultExt, Snafu};
use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::info;

/// Driver installation error variants.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum InstallError {
    #[snafu(display("Invalid driver name '{name}', expected <vendor>~<driver>"))]
    DriverName { name: String },
    #[snafu(display("Failed to create the driver directory '{}'", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to copy the driver '{}' to '{}'", from.display(), to.display()))]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to install the driver as '{}'", path.display()))]
    Install {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Install the driver binary in the kubelet volume plugin directory, as
/// `<plugin_dir>/<vendor>~<driver>/<driver>`, replacing any previous copy.
/// The binary is staged next to its final name and renamed over it, so the kubelet never
/// runs a partial copy.
pub fn install_driver(
    binary: &Path,
    plugin_dir: &Path,
    driver_name: &str,
) -> Result<PathBuf, InstallError> {
    let driver = match driver_name.split_once('~') {
        Some((vendor, driver))
            if !vendor.is_empty() && !driver.is_empty() && !driver.contains(['~', '/']) =>
        {
            driver
        }
        _ => {
            return Err(InstallError::DriverName {
                name: driver_name.to_string(),
            })
        }
    };

    let driver_dir = plugin_dir.join(driver_name);
    std::fs::create_dir_all(&driver_dir).context(CreateDir { path: &driver_dir })?;

    let staging = driver_dir.join(format!(".{driver}.tmp"));
    std::fs::copy(binary, &staging).context(Copy {
        from: binary,
        to: &staging,
    })?;
    std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
        .context(Install { path: &staging })?;

    let target = driver_dir.join(driver);
    std::fs::rename(&staging, &target).context(Install { path: &target })?;
    info!(driver = %target.display(), binary = %binary.display(), "Installed the driver");
    Ok(target)
}
