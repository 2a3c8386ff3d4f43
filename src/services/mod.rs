pub mod file_converter;
pub mod image_optimiser;
pub mod key_builder;
pub mod local_file_writer;
pub mod safe_exec;
pub mod storage_service;
