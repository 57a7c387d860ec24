pub mod parser;

pub use parser::{
    identity_key, normalize_message_id, MessageParser, ParseError, ParsedAttachment, ParsedMessage,
    SurrogateIdentity,
};
