//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

fn main() {
    env_logger::init();
    if let Err(err) = mapedit_cli::run() {
        eprintln!("mapedit: {err:#}");
        std::process::exit(1);
    }
}
