mod actuator;
mod fallback;

pub use actuator::{health, index as actuator_index, info};
pub use fallback::fallback;
