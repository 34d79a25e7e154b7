use serde::Serialize;

/// Outcome of a driver call, as understood by the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum Status {
    Success,
    Failure,
    #[serde(rename = "Not supported")]
    NotSupported,
}

/// Capabilities reported on init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct Capabilities {
    attach: bool,
}

/// The json document printed on stdout for the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct DriverStatus {
    status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<Capabilities>,
}

impl DriverStatus {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            device: None,
            capabilities: None,
        }
    }
    pub(crate) fn success() -> Self {
        Self::new(Status::Success, "")
    }
    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self::new(Status::Failure, message)
    }
    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::new(Status::NotSupported, message)
    }
    /// Init reply: attach and detach are driven by the mount calls, so the kubelet must not
    /// call them.
    pub(crate) fn initialised() -> Self {
        Self {
            capabilities: Some(Capabilities { attach: false }),
            ..Self::success()
        }
    }
    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
    pub(crate) fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }
    /// The process exit code matching this status.
    pub(crate) fn exit_code(&self) -> i32 {
        match self.status {
            Status::Failure => 1,
            Status::Success | Status::NotSupported => 0,
        }
    }

    pub(crate) fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|error| {
            serde_json::json!({ "status": "Failure", "message": error.to_string() }).to_string()
        })
    }
}
