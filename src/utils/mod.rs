pub mod codec;
pub mod helpers;
