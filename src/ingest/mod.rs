/// File ingestion: line parsing and tailing
pub mod parser;
pub mod tailer;

pub use parser::{parse_line, parse_line_at};
pub use tailer::{
    file_stream_id, spawn_file_tailers, FileTailer, StopReason, TailerHandle, TailerOptions,
    TailerState,
};
