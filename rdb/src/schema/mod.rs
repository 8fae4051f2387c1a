mod parser;
mod types;

pub use parser::{parse_schemas, parse_schemas_str};
pub use types::*;
