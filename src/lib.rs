pub mod pipeline;
pub mod streamer_core;
