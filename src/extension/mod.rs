//! Page-resident action executor and the channel that reaches it.

pub mod channel;
pub mod executor;
pub mod protocol;
pub mod tab_document;

pub use channel::ExtensionHandle;
pub use executor::{Document, ExtensionExecutor, KeyPhase, Link};
pub use protocol::{Command, ExtensionRequest, ExtensionResponse, ResponseStatus};
pub use tab_document::TabDocument;
