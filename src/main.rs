fn main() {
    if let Err(error) = quote_alert_desk_lib::run() {
        eprintln!("quote-alert-desk: {error}");
        std::process::exit(1);
    }
}
