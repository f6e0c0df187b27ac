pub mod builder;
pub mod parser;

pub use builder::{build, parse_timestamp, SortKey, TimelineEntry, ToolDisplay};
pub use parser::{CodeLanguage, Delegation, MemoryHit, ToolStatus};
