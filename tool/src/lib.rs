pub mod error;
pub mod halftrack;
pub mod image_d64;
pub mod image_g64;
pub mod image_i64;
