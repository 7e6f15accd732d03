//! Id generators handed out to sessions.

pub mod document;
pub mod statement;

pub use document::{DocumentIdAggregator, DocumentIdGenerator, IdVariables, DOCUMENT_ID_LEN};
pub use statement::PreparedStatementRegistry;
