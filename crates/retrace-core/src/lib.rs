pub mod chain;
pub mod error;
pub mod format;
pub mod http_dump;
pub mod record_file;
pub mod redact;
pub mod request;
pub mod response;
pub mod store;
pub mod transcript;

pub use chain::{ChainState, Resolved};
pub use error::{StoreError, TranscriptError};
pub use format::Format;
pub use record_file::{RecordFile, RecordInteraction};
pub use redact::Redactor;
pub use request::{Body, Headers, RecordedRequest, HEAD_SHA, TEST_NAME_HEADER};
pub use response::{HeaderReplacement, RecordedResponse};
pub use store::{Layout, Store, StoredResponse};
pub use transcript::{parse_transcript, Direction, TranscriptEntry};
