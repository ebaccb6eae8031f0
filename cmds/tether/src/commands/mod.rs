pub mod apply;
pub mod delete;
pub mod install;

pub mod util;
