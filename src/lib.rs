pub mod error;
pub mod export;
pub mod hf;
pub mod segformer;
pub mod weights;

pub use error::Result;
