pub mod encoder;
pub mod pipeline;
pub mod profile;
