//! Data processing modules.

pub mod boundary;
pub mod cropping;
pub mod external;
pub mod filtering;
pub mod footprint;
pub mod merging;

// Re-export key types for convenience
pub use boundary::{extract_boundary, BoundaryError};
pub use cropping::{common_box, crop, cut_to_common_box, BoundingBox};
pub use external::{CloudCompare, Invocation, ToolError};
pub use filtering::{filter, AttributeFilter};
pub use footprint::{derive_offset, intersect, CoordinateOffset, FootprintError};
pub use merging::{merge, PROVENANCE_CHANNEL};
