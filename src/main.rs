fn main() {
    if let Err(err) = edgesense_lib::run() {
        log::error!("edgesense failed: {err:#}");
        eprintln!("edgesense: {err:#}");
        std::process::exit(1);
    }
}
