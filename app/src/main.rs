//! Command line entry point of the PM2.io agent

fn main() {
    if let Err(err) = app::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
