pub mod atdome_cmd_regex;
pub mod atdome_csc;
pub mod atdome_model;
pub mod axis_state;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mock_controller;
pub mod move_code;
pub mod poll_scheduler;
pub mod status;
pub mod status_parser;
