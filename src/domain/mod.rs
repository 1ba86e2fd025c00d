//! Domain layer: entities, errors and pure helpers with no I/O.

pub mod chunk_buffer;
pub mod entities;
pub mod errors;
pub mod mapping;
pub mod path_template;
