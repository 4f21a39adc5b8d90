pub mod parser;
pub mod state_file;

pub use parser::{ParseError, ParserStatsSnapshot, StateParserPool};
pub use state_file::{StateFile, StateInstance, StateResource};
