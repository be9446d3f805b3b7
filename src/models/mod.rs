mod descriptor;
mod post;

pub use descriptor::*;
pub use post::*;
