fn main() {
    if let Err(err) = keba_wallbox_monitor::app::run() {
        eprintln!("service startup failed: {err}");
        std::process::exit(1);
    }
}
