mod common;

pub mod depend_worker;
pub mod monitor_worker;
pub mod submit_worker;
pub mod supervisor;
