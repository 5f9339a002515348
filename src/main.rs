//! phaseguard CLI binary
//!
//! All logic is in the library; main.rs only invokes cli::run().

fn main() {
    // cli::run() prints the envelope and any error report itself
    if let Err(code) = phaseguard::cli::run() {
        std::process::exit(code.as_i32());
    }
}
