/// Source error of the underlying store client.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// All errors that can be returned from the pstor.
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum Error {
    /// Failed to connect to the key-value store.
    #[snafu(display("Failed to connect to store. Error {}", source))]
    Connect { source: ClientError },
    /// Failed to 'put' an entry in the store.
    #[snafu(display(
        "Failed to 'put' entry with key {} and value {:?}. Error {}",
        key,
        value,
        source
    ))]
    Put {
        key: String,
        value: String,
        source: ClientError,
    },
    /// Failed to 'get' an entry from the store.
    #[snafu(display("Failed to 'get' entry with key {}. Error {}", key, source))]
    Get { key: String, source: ClientError },
    /// Failed to 'get' an entry, with the given prefix, from the store.
    #[snafu(display("Failed to 'get' entry with prefix {}. Error {}", prefix, source))]
    GetPrefix { prefix: String, source: ClientError },
    /// Failed to find an entry with the given key.
    #[snafu(display("Entry with key {} not found.", key))]
    MissingEntry { key: String },
    /// The entry was modified (or created, or removed) since it was read.
    #[snafu(display(
        "Entry with key {} is no longer at the expected revision {:?}.",
        key,
        expected
    ))]
    Conflict {
        key: String,
        expected: Option<crate::Revision>,
    },
    /// Failed to 'delete' an entry from the store.
    #[snafu(display("Failed to 'delete' entry with key {}. Error {}", key, source))]
    Delete { key: String, source: ClientError },
    /// Empty key.
    #[snafu(display("Failed to get key as string. Error {}", source))]
    KeyString { source: ClientError },
    /// Failed to deserialise value.
    #[snafu(display("Failed to deserialise value {}. Error {}", value, source))]
    DeserialiseValue {
        value: String,
        source: serde_json::Error,
    },
    /// Failed to serialise value.
    #[snafu(display("Failed to serialise value. Error {}", source))]
    SerialiseValue { source: serde_json::Error },
    /// Failed to load the store contents from its backing file.
    #[snafu(display("Failed to load store from {}. Error {}", path.display(), source))]
    Load {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// Failed to persist the store contents to its backing file.
    #[snafu(display("Failed to persist store to {}. Error {}", path.display(), source))]
    Persist {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// Failed to run operation within a timeout.
    #[snafu(display("Timed out during {} operation after {:?}", operation, timeout))]
    Timeout {
        operation: String,
        timeout: std::time::Duration,
    },
}

impl Error {
    /// Whether this is a "not found" result, as opposed to a transport failure.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingEntry { .. })
    }
    /// Whether this is a compare-and-set revision mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
