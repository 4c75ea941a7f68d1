pub mod openai;
pub mod protocol;
pub mod types;
