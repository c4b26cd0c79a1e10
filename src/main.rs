fn main() {
    if let Err(err) = lagfs::run(std::env::args()) {
        eprintln!("lagfs error: {err}");
        std::process::exit(1);
    }
}
