pub mod channel;
pub mod db;
pub mod keba_debug_file;
pub mod keba_udp;
pub mod notifier;
