pub mod openai;
pub mod catalog;

pub use openai::OpenAiService;
