pub mod routing;
pub mod subnet;
