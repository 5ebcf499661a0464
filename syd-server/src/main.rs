//! Binary entrypoint for `syd-server`.

mod app;
mod relay;

fn main() {
    if let Err(err) = app::run() {
        eprintln!("failed to start syd-server: {err}");
        std::process::exit(1);
    }
}
