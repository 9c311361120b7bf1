pub mod id_generator;
pub mod json_ext;
