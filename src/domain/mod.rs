pub mod keba_payload;
pub mod models;
pub mod polling;
pub mod session_time;
