pub mod opener;
pub mod passthrough;
pub mod select;
pub mod source;
pub mod transform;

pub use opener::Opener;
pub use passthrough::Passthrough;
pub use select::Select;
pub use source::{InStream, RecordsSource};
pub use transform::Transform;
