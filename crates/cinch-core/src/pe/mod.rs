//! PE structures and the header-validation pipeline.

pub mod headers;
pub mod image;

pub use headers::{MachineKind, PeHeader, PeSection, WidthSpec};
pub use image::PeImage;
