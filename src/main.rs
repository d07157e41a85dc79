fn main() {
    let _ = dotenvy::dotenv();
    match sourcesync::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}
