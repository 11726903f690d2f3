pub mod mock_controller;

pub use mock_controller::{run_mock_controller, MockConfig, MockDomeController};
