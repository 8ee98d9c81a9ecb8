//! Core types, wire protocol, config, errors, and collaborator interfaces
//! shared by the Pathfinder coordinator and robot agent.

pub mod assignment;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;
pub mod version;
