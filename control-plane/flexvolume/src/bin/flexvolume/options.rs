use flexvolume::attachment::{AttachOptions, VolumeId};
use serde::Deserialize;
use std::str::FromStr;

/// Read-only access mode, as passed in `kubernetes.io/readwrite`.
const READ_ONLY: &str = "ro";

/// The json options the kubelet passes to the attach and mount calls.
/// Every value is a string, and keys we don't need (pod name, service account...) are ignored.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub(crate) struct DriverOptions {
    #[serde(rename = "kubernetes.io/fsType", default)]
    pub(crate) fs_type: String,
    #[serde(rename = "kubernetes.io/readwrite", default)]
    pub(crate) read_write: String,
    #[serde(rename = "kubernetes.io/pvOrVolumeName", default)]
    pub(crate) volume_name: String,
    #[serde(default)]
    pub(crate) pool: String,
    #[serde(default)]
    pub(crate) image: String,
}

impl FromStr for DriverOptions {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl DriverOptions {
    /// The volume, named after the persistent volume when no image is given.
    pub(crate) fn volume(&self) -> VolumeId {
        let image = match self.image.as_str() {
            "" => &self.volume_name,
            image => image,
        };
        VolumeId::new(&self.pool, image)
    }

    /// Whether the pod must get a read-only mount.
    pub(crate) fn read_only(&self) -> bool {
        self.read_write == READ_ONLY
    }

    /// Build the validated `AttachOptions` of these driver options.
    pub(crate) fn attach_options(&self) -> Result<AttachOptions, String> {
        let volume = self.volume();
        volume.validate()?;
        let options = AttachOptions::new(volume).with_read_only(self.read_only());
        Ok(match self.fs_type.as_str() {
            "" => options,
            fs_type => options.with_fs_type(fs_type),
        })
    }
}
