mod gateway;

pub use gateway::*;
