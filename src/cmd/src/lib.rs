pub mod agent;
pub mod cmd;
pub mod controller;
