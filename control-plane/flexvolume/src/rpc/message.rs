//! Messages exchanged between the driver and the agent.
//!
//! Each connection carries exactly one json encoded [`Request`] followed by one json encoded
//! [`Response`]. Requests are tagged with the name of the controller method they invoke.

use crate::{
    attachment::{AttachOptions, VolumeAttachment, VolumeId},
    error::ReplyError,
};
use serde::{Deserialize, Serialize};

/// A call of a controller method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    /// Resolve a pod mount directory to the options of its volume.
    #[serde(rename = "FlexvolumeController.GetAttachInfoFromMountDir")]
    GetAttachInfoFromMountDir { mount_dir: String },
    /// Get the global mount path of a volume.
    #[serde(rename = "FlexvolumeController.GetGlobalMountPath")]
    GetGlobalMountPath { volume: VolumeId },
    /// Remove a pod mount directory from its attachment record.
    #[serde(rename = "FlexvolumeController.RemoveAttachmentObject")]
    RemoveAttachmentObject(AttachOptions),
    /// Detach a volume from the node.
    #[serde(rename = "FlexvolumeController.Detach")]
    Detach(AttachOptions),
    /// Attach a volume to the node.
    #[serde(rename = "FlexvolumeController.Attach")]
    Attach(AttachOptions),
    /// Attach and mount a volume on a pod mount directory.
    #[serde(rename = "FlexvolumeController.Mount")]
    Mount(AttachOptions),
    /// Unmount a pod mount directory, detaching its volume if it was the last reference.
    #[serde(rename = "FlexvolumeController.Unmount")]
    Unmount { mount_dir: String },
    /// Log a driver message on the agent.
    #[serde(rename = "FlexvolumeController.Log")]
    Log { message: String, is_error: bool },
    /// List the attachment records of the node.
    #[serde(rename = "FlexvolumeController.ListAttachments")]
    ListAttachments,
}

impl Request {
    /// The method name of the request.
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetAttachInfoFromMountDir { .. } => "GetAttachInfoFromMountDir",
            Request::GetGlobalMountPath { .. } => "GetGlobalMountPath",
            Request::RemoveAttachmentObject(_) => "RemoveAttachmentObject",
            Request::Detach(_) => "Detach",
            Request::Attach(_) => "Attach",
            Request::Mount(_) => "Mount",
            Request::Unmount { .. } => "Unmount",
            Request::Log { .. } => "Log",
            Request::ListAttachments => "ListAttachments",
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::GetAttachInfoFromMountDir { mount_dir } | Request::Unmount { mount_dir } => {
                write!(f, "{}({mount_dir})", self.method())
            }
            Request::GetGlobalMountPath { volume } => write!(f, "{}({volume})", self.method()),
            Request::RemoveAttachmentObject(options)
            | Request::Detach(options)
            | Request::Attach(options)
            | Request::Mount(options) => {
                write!(f, "{}({}", self.method(), options.volume)?;
                if !options.mount_dir.is_empty() {
                    write!(f, ", {}", options.mount_dir)?;
                }
                write!(f, ")")
            }
            Request::Log { is_error, .. } => write!(f, "{}(error: {is_error})", self.method()),
            Request::ListAttachments => write!(f, "{}", self.method()),
        }
    }
}

/// The result of a controller method call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value")]
pub enum Response {
    /// The options of a volume.
    AttachInfo(AttachOptions),
    /// The global mount path of a volume.
    GlobalMountPath(String),
    /// The attachment records of the node.
    Attachments(Vec<VolumeAttachment>),
    /// The call succeeded, with nothing to return.
    Ok,
    /// The call failed.
    Error(ReplyError),
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::AttachInfo(options) => write!(f, "AttachInfo({})", options.volume),
            Response::GlobalMountPath(path) => write!(f, "GlobalMountPath({path})"),
            Response::Attachments(attachments) => {
                write!(f, "Attachments({})", attachments.len())
            }
            Response::Ok => write!(f, "Ok"),
            Response::Error(error) => write!(f, "Error({error})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn method_names_on_the_wire() {
        let request = Request::GetAttachInfoFromMountDir {
            mount_dir: "/pods/p1/vol".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "FlexvolumeController.GetAttachInfoFromMountDir");
        assert_eq!(json["params"]["mount_dir"], "/pods/p1/vol");

        let json = serde_json::to_value(Request::ListAttachments).unwrap();
        assert_eq!(json["method"], "FlexvolumeController.ListAttachments");

        let json = r#"{"method":"FlexvolumeController.Detach","params":{"volume":{"pool":"pool1","image":"image1"}}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            Request::Detach(AttachOptions::new(VolumeId::new("pool1", "image1")))
        );
        assert_eq!(request.to_string(), "Detach(pool1/image1)");
    }

    #[test]
    fn error_response() {
        let response = Response::Error(ReplyError::new(ErrorKind::Resolution, "not found"));
        let json = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.to_string(), "Error(Resolution: not found)");
    }
}
